//! Client configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use roost_core::{ProtocolVersion, QoS, Will};

use crate::persist::{NonePersist, PersistStore};
use crate::router::{TextRouter, TopicRouter};

/// One broker target.
#[derive(Debug, Clone)]
pub struct Server {
    pub addr: String,
    /// Whether the connection is wrapped in TLS.
    pub secure: bool,
}

/// TLS material source for secure servers.
#[derive(Clone, Default)]
pub(crate) enum TlsOptions {
    /// System roots via webpki, no client auth.
    #[default]
    SystemRoots,
    /// Certificate, key and CA loaded from files.
    Files {
        cert: PathBuf,
        key: PathBuf,
        ca: PathBuf,
        server_name: Option<String>,
        skip_verify: bool,
    },
    /// PEM material supplied from in-memory readers.
    Pem {
        cert: Vec<u8>,
        key: Vec<u8>,
        ca: Vec<u8>,
        server_name: Option<String>,
        skip_verify: bool,
    },
    /// A pre-built rustls configuration.
    Prebuilt(Arc<rustls::ClientConfig>),
}

/// Client configuration with consuming builder methods.
///
/// ```no_run
/// use roost_client::ClientConfig;
/// use roost_core::ProtocolVersion;
///
/// let config = ClientConfig::new()
///     .server("localhost:1883")
///     .client_id("roost-sensor-7")
///     .clean_session(true)
///     .keepalive(30, 1.5)
///     .version(ProtocolVersion::V5, true)
///     .auto_reconnect(true);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) servers: Vec<Server>,
    pub(crate) version: ProtocolVersion,
    pub(crate) compromise: bool,
    pub(crate) clean_session: bool,
    pub(crate) client_id: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) keep_alive: u16,
    pub(crate) keepalive_factor: f64,
    pub(crate) will: Option<Will>,
    pub(crate) dial_timeout: Duration,
    pub(crate) send_buf: usize,
    pub(crate) recv_buf: usize,
    pub(crate) first_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) backoff_factor: f64,
    pub(crate) auto_reconnect: bool,
    pub(crate) tls: TlsOptions,
    pub(crate) persist: Arc<dyn PersistStore>,
    pub(crate) router: Arc<dyn TopicRouter>,
    pub(crate) log_level: Option<log::LevelFilter>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            version: ProtocolVersion::V311,
            compromise: false,
            clean_session: false,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 120,
            keepalive_factor: 1.5,
            will: None,
            dial_timeout: Duration::from_secs(20),
            send_buf: 1,
            recv_buf: 1,
            first_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_factor: 1.5,
            auto_reconnect: false,
            tls: TlsOptions::default(),
            persist: Arc::new(NonePersist),
            router: Arc::new(TextRouter::new()),
            log_level: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain TCP broker target (`host:port`).
    pub fn server(mut self, addr: impl Into<String>) -> Self {
        self.servers.push(Server {
            addr: addr.into(),
            secure: false,
        });
        self
    }

    /// Add a TLS broker target (`host:port`).
    pub fn secure_server(mut self, addr: impl Into<String>) -> Self {
        self.servers.push(Server {
            addr: addr.into(),
            secure: true,
        });
        self
    }

    /// Initial protocol version, and whether to retry once at the next
    /// lower version when the broker answers "unsupported protocol
    /// version".
    pub fn version(mut self, version: ProtocolVersion, compromise: bool) -> Self {
        self.version = version;
        self.compromise = compromise;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Username and password for the CONNECT payload.
    pub fn identity(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Keepalive interval in seconds and the timeout factor. The server
    /// considers the session dead after 1.5x the interval; `factor`
    /// bounds how long the client waits for a PINGRESP. A factor of 1 or
    /// less falls back to 1.2.
    pub fn keepalive(mut self, seconds: u16, factor: f64) -> Self {
        self.keep_alive = seconds;
        self.keepalive_factor = if factor > 1.0 { factor } else { 1.2 };
        self
    }

    /// Register a will message published by the broker on ungraceful
    /// disconnect.
    pub fn will(
        mut self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Self {
        self.will = Some(Will::new(topic, payload).qos(qos).retain(retain));
        self
    }

    /// Hard bound, in seconds, on TCP/TLS establishment and on CONNACK
    /// receipt.
    pub fn dial_timeout(mut self, seconds: u64) -> Self {
        self.dial_timeout = Duration::from_secs(seconds);
        self
    }

    /// Outbound and deliver queue capacities; each is clamped to at
    /// least one.
    pub fn buf(mut self, send: usize, recv: usize) -> Self {
        self.send_buf = send.max(1);
        self.recv_buf = recv.max(1);
        self
    }

    /// Reconnect backoff: first delay, upper bound and growth factor.
    /// Clamped so first >= 1 ms, max >= first and factor >= 1.
    pub fn backoff(mut self, first: Duration, max: Duration, factor: f64) -> Self {
        self.first_delay = first.max(Duration::from_millis(1));
        self.max_delay = max.max(self.first_delay);
        self.backoff_factor = if factor < 1.0 { 1.0 } else { factor };
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Client certificate, key and CA file paths for secure servers.
    pub fn tls(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_file: impl Into<PathBuf>,
        server_name_override: Option<String>,
        skip_verify: bool,
    ) -> Self {
        self.tls = TlsOptions::Files {
            cert: cert_file.into(),
            key: key_file.into(),
            ca: ca_file.into(),
            server_name: server_name_override,
            skip_verify,
        };
        self
    }

    /// TLS material from in-memory PEM readers.
    pub fn tls_pem(
        mut self,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        ca_pem: impl Into<Vec<u8>>,
        server_name_override: Option<String>,
        skip_verify: bool,
    ) -> Self {
        self.tls = TlsOptions::Pem {
            cert: cert_pem.into(),
            key: key_pem.into(),
            ca: ca_pem.into(),
            server_name: server_name_override,
            skip_verify,
        };
        self
    }

    /// Use a pre-built rustls client configuration.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = TlsOptions::Prebuilt(config);
        self
    }

    /// Session persistence backend; defaults to the no-op store.
    pub fn persist(mut self, method: Arc<dyn PersistStore>) -> Self {
        self.persist = method;
        self
    }

    /// Topic dispatcher; defaults to exact-text matching.
    pub fn router(mut self, router: Arc<dyn TopicRouter>) -> Self {
        self.router = router;
        self
    }

    /// Maximum level for the `log` facade, applied when `connect` runs.
    pub fn log_level(mut self, level: log::LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_documented_values() {
        let config = ClientConfig::new();
        assert!(config.servers.is_empty());
        assert_eq!(config.version, ProtocolVersion::V311);
        assert_eq!(config.keep_alive, 120);
        assert_eq!(config.send_buf, 1);
        assert_eq!(config.first_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(120));
        assert!(!config.auto_reconnect);
        assert_eq!(config.persist.name(), "none");
        assert_eq!(config.router.name(), "text");
    }

    #[test]
    fn keepalive_factor_is_clamped() {
        let config = ClientConfig::new().keepalive(30, 0.5);
        assert_eq!(config.keep_alive, 30);
        assert_eq!(config.keepalive_factor, 1.2);
    }

    #[test]
    fn buf_and_backoff_are_clamped() {
        let config = ClientConfig::new()
            .buf(0, 0)
            .backoff(Duration::ZERO, Duration::ZERO, 0.0);
        assert_eq!(config.send_buf, 1);
        assert_eq!(config.recv_buf, 1);
        assert_eq!(config.first_delay, Duration::from_millis(1));
        assert_eq!(config.max_delay, Duration::from_millis(1));
        assert_eq!(config.backoff_factor, 1.0);
    }

    #[test]
    fn server_kinds_are_tracked() {
        let config = ClientConfig::new()
            .server("a:1883")
            .secure_server("b:8883");
        assert!(!config.servers[0].secure);
        assert!(config.servers[1].secure);
    }
}
