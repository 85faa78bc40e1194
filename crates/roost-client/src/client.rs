//! Client supervisor.
//!
//! A [`Client`] fans one logical session out across every configured
//! server: each gets its own connect/reconnect loop, while the outbound
//! queue, deliver queue, identifier generator and persistence are shared.
//! Two client-level tasks complete the picture: one drains the deliver
//! queue into the topic router, the other fans operation results out to
//! the registered callbacks.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use roost_core::{Disconnect, Packet, Publish, ProtocolVersion, QoS, Subscribe, Topic, Unsubscribe};

use crate::backoff::Backoff;
use crate::config::{ClientConfig, Server};
use crate::conn::{Connection, SessionEnd};
use crate::error::{ClientError, Result};
use crate::notify::{notify_persist, notify_pub, notify_sub, notify_unsub, Notification};
use crate::packet_id::IdGenerator;
use crate::persist::send_key;
use crate::router::TopicHandler;

/// Synthetic reason code passed to the connection handler when the
/// failure happened locally (dial error, timeout, malformed handshake)
/// rather than in a CONNACK.
pub const CODE_LOCAL_FAILURE: u8 = u8::MAX;

/// Connection outcome callback: (server, reason code, error).
pub type ConnHandler = Arc<dyn Fn(&str, u8, Option<&ClientError>) + Send + Sync>;
/// Publish result callback: (topic, error).
pub type PubHandler = Arc<dyn Fn(&str, Option<&ClientError>) + Send + Sync>;
/// Subscribe result callback: filters paired with granted QoS codes
/// (0..=2, or 0x80 for a failed filter).
pub type SubHandler = Arc<dyn Fn(&[(String, u8)], Option<&ClientError>) + Send + Sync>;
/// Unsubscribe result callback.
pub type UnsubHandler = Arc<dyn Fn(&[String], Option<&ClientError>) + Send + Sync>;
/// Network event callback: (server, error).
pub type NetHandler = Arc<dyn Fn(&str, &ClientError) + Send + Sync>;
/// Persistence failure callback.
pub type PersistHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    publish: Option<PubHandler>,
    subscribe: Option<SubHandler>,
    unsubscribe: Option<UnsubHandler>,
    net: Option<NetHandler>,
    persist: Option<PersistHandler>,
}

/// State shared between the client surface and its connections.
pub(crate) struct Shared {
    pub(crate) cfg: ClientConfig,
    pub(crate) id_gen: IdGenerator,
    pub(crate) send_tx: mpsc::Sender<Packet>,
    /// The outbound queue has one producer side per API call and is
    /// drained by whichever connection sender gets the lock first,
    /// preserving submission order.
    pub(crate) send_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    pub(crate) deliver_tx: mpsc::Sender<Publish>,
    pub(crate) notify_tx: mpsc::Sender<Notification>,
    pub(crate) cancel: CancellationToken,
}

/// Invoke the connection handler off the connect loop's critical path.
pub(crate) fn notify_conn(
    handler: &Option<ConnHandler>,
    server: &str,
    code: u8,
    err: Option<ClientError>,
) {
    if let Some(handler) = handler {
        let handler = Arc::clone(handler);
        let server = server.to_string();
        tokio::spawn(async move {
            handler(&server, code, err.as_ref());
        });
    }
}

/// An MQTT client.
///
/// ```no_run
/// use std::sync::Arc;
/// use roost_client::{Client, ClientConfig};
/// use roost_core::{Publish, QoS};
///
/// # async fn run() -> roost_client::Result<()> {
/// let client = Client::new(
///     ClientConfig::new()
///         .server("localhost:1883")
///         .client_id("roost-demo")
///         .clean_session(true)
///         .auto_reconnect(true),
/// )?;
///
/// client.handle("greeting", Arc::new(|topic, _qos, payload| {
///     println!("{topic}: {payload:?}");
/// }));
/// client.connect(None);
///
/// client.publish(Publish::new("greeting", QoS::AtLeastOnce, "hello")).await;
/// client.destroy(false).await;
/// client.wait().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    shared: Arc<Shared>,
    handlers: Arc<RwLock<Handlers>>,
    deliver_rx: StdMutex<Option<mpsc::Receiver<Publish>>>,
    notify_rx: StdMutex<Option<mpsc::Receiver<Notification>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Build a client from its configuration. At least one server is
    /// required.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(ClientError::NoServers);
        }

        let (send_tx, send_rx) = mpsc::channel(config.send_buf);
        let (deliver_tx, deliver_rx) = mpsc::channel(config.recv_buf);
        let (notify_tx, notify_rx) = mpsc::channel(32);

        Ok(Self {
            shared: Arc::new(Shared {
                cfg: config,
                id_gen: IdGenerator::new(),
                send_tx,
                send_rx: tokio::sync::Mutex::new(send_rx),
                deliver_tx,
                notify_tx,
                cancel: CancellationToken::new(),
            }),
            handlers: Arc::new(RwLock::new(Handlers::default())),
            deliver_rx: StdMutex::new(Some(deliver_rx)),
            notify_rx: StdMutex::new(Some(notify_rx)),
            workers: StdMutex::new(Vec::new()),
        })
    }

    /// Register a per-topic message handler with the configured router.
    pub fn handle(&self, topic: &str, handler: TopicHandler) {
        log::debug!("registered topic handler for {topic}");
        self.shared.cfg.router.add(topic, handler);
    }

    /// Connect to every configured server and start the client tasks.
    ///
    /// Must be called from within a tokio runtime. The handler, when
    /// given, is invoked once per connection attempt outcome.
    pub fn connect(&self, handler: Option<ConnHandler>) {
        if let Some(level) = self.shared.cfg.log_level {
            log::set_max_level(level);
        }

        let mut workers = self.lock_workers();

        if let Some(deliver_rx) = self.take(&self.deliver_rx) {
            workers.push(tokio::spawn(deliver_loop(
                Arc::clone(&self.shared),
                deliver_rx,
            )));
        }
        if let Some(notify_rx) = self.take(&self.notify_rx) {
            workers.push(tokio::spawn(fanout_loop(
                Arc::clone(&self.handlers),
                self.shared.cancel.clone(),
                notify_rx,
            )));
        }

        for server in self.shared.cfg.servers.clone() {
            log::debug!("connecting to {}", server.addr);
            workers.push(tokio::spawn(supervise_server(
                Arc::clone(&self.shared),
                server,
                handler.clone(),
            )));
        }
    }

    /// Publish one message. QoS above zero reserves a packet identifier
    /// and persists the in-flight state before the packet is queued, so
    /// wire order matches submission order even across reconnects.
    pub async fn publish(&self, mut message: Publish) {
        if self.is_closing() {
            return;
        }

        if message.qos != QoS::AtMostOnce && message.packet_id.is_none() {
            let assigned = self.shared.id_gen.assign(|id| {
                message.packet_id = Some(id);
                Packet::Publish(message.clone())
            });
            let Some((id, packet)) = assigned else {
                notify_pub(
                    &self.shared.notify_tx,
                    message.topic.clone(),
                    Some(ClientError::IdExhausted),
                );
                return;
            };
            notify_persist(
                &self.shared.notify_tx,
                self.shared
                    .cfg
                    .persist
                    .store(&send_key(id), packet)
                    .map_err(Into::into),
            );
        }

        let _ = self.shared.send_tx.send(Packet::Publish(message)).await;
    }

    /// Subscribe to one or more topic filters.
    pub async fn subscribe(&self, topics: &[Topic]) {
        if self.is_closing() {
            return;
        }
        log::debug!("subscribe: {topics:?}");

        let assigned = self.shared.id_gen.assign(|id| {
            Packet::Subscribe(Subscribe {
                packet_id: id,
                topics: topics.to_vec(),
                properties: None,
            })
        });
        let Some((_, packet)) = assigned else {
            let result = topics.iter().map(|t| (t.name.clone(), 0)).collect();
            notify_sub(
                &self.shared.notify_tx,
                result,
                Some(ClientError::IdExhausted),
            );
            return;
        };

        let _ = self.shared.send_tx.send(packet).await;
    }

    /// Unsubscribe from one or more topic filters.
    pub async fn unsubscribe(&self, filters: &[String]) {
        if self.is_closing() {
            return;
        }
        log::debug!("unsubscribe: {filters:?}");

        let assigned = self.shared.id_gen.assign(|id| {
            Packet::Unsubscribe(Unsubscribe {
                packet_id: id,
                filters: filters.to_vec(),
                properties: None,
            })
        });
        let Some((_, packet)) = assigned else {
            notify_unsub(
                &self.shared.notify_tx,
                filters.to_vec(),
                Some(ClientError::IdExhausted),
            );
            return;
        };

        let _ = self.shared.send_tx.send(packet).await;
    }

    /// Tear the client down.
    ///
    /// With `force`, every task observes cancellation and exits without
    /// putting a DISCONNECT on the wire. Otherwise a DISCONNECT is
    /// queued; once a sender has flushed it, cancellation follows.
    pub async fn destroy(&self, force: bool) {
        log::debug!("destroying client (force={force})");
        if force {
            self.shared.cancel.cancel();
        } else {
            let _ = self
                .shared
                .send_tx
                .send(Packet::Disconnect(Disconnect::default()))
                .await;
        }
    }

    /// Block until every task spawned by [`connect`](Client::connect)
    /// has exited.
    pub async fn wait(&self) {
        let workers: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        log::debug!("waiting for {} workers", workers.len());
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Register the publish result callback.
    pub fn handle_pub(&self, handler: impl Fn(&str, Option<&ClientError>) + Send + Sync + 'static) {
        self.lock_handlers().publish = Some(Arc::new(handler));
    }

    /// Register the subscribe result callback.
    pub fn handle_sub(
        &self,
        handler: impl Fn(&[(String, u8)], Option<&ClientError>) + Send + Sync + 'static,
    ) {
        self.lock_handlers().subscribe = Some(Arc::new(handler));
    }

    /// Register the unsubscribe result callback.
    pub fn handle_unsub(
        &self,
        handler: impl Fn(&[String], Option<&ClientError>) + Send + Sync + 'static,
    ) {
        self.lock_handlers().unsubscribe = Some(Arc::new(handler));
    }

    /// Register the network event callback.
    pub fn handle_net(&self, handler: impl Fn(&str, &ClientError) + Send + Sync + 'static) {
        self.lock_handlers().net = Some(Arc::new(handler));
    }

    /// Register the persistence failure callback.
    pub fn handle_persist(&self, handler: impl Fn(&ClientError) + Send + Sync + 'static) {
        self.lock_handlers().persist = Some(Arc::new(handler));
    }

    /// Identifiers currently reserved by open exchanges.
    pub fn in_flight(&self) -> usize {
        self.shared.id_gen.in_flight()
    }

    fn is_closing(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn take<T>(&self, slot: &StdMutex<Option<T>>) -> Option<T> {
        slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-server connect/reconnect loop.
async fn supervise_server(shared: Arc<Shared>, server: Server, handler: Option<ConnHandler>) {
    let cfg = &shared.cfg;
    let mut version = cfg.version;
    let mut backoff = Backoff::new(cfg.first_delay, cfg.max_delay, cfg.backoff_factor);

    loop {
        if shared.cancel.is_cancelled() {
            return;
        }

        let connection = Connection::new(Arc::clone(&shared), server.clone(), version);
        match connection.run(&handler).await {
            SessionEnd::Closing | SessionEnd::Handshake => return,
            SessionEnd::Downgrade => {
                version = ProtocolVersion::V311;
            }
            SessionEnd::Lost => {
                if !cfg.auto_reconnect {
                    return;
                }
                // The session reached the broker; the next outage starts
                // the schedule over.
                backoff.reset();
                let delay = backoff.next_delay();
                log::error!("reconnecting to {} in {delay:?}", server.addr);
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            SessionEnd::Dial => {
                if !cfg.auto_reconnect {
                    return;
                }
                let delay = backoff.next_delay();
                log::error!("redialing {} in {delay:?}", server.addr);
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Drain the deliver queue into the topic router.
async fn deliver_loop(shared: Arc<Shared>, mut deliver_rx: mpsc::Receiver<Publish>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            publish = deliver_rx.recv() => match publish {
                None => return,
                Some(publish) => shared.cfg.router.dispatch(&publish),
            },
        }
    }
}

/// Turn notifications into callback invocations.
async fn fanout_loop(
    handlers: Arc<RwLock<Handlers>>,
    cancel: CancellationToken,
    mut notify_rx: mpsc::Receiver<Notification>,
) {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            n = notify_rx.recv() => match n {
                None => return,
                Some(n) => n,
            },
        };

        match notification {
            Notification::Pub { topic, err } => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .publish
                    .clone();
                if let Some(handler) = handler {
                    handler(&topic, err.as_ref());
                }
            }
            Notification::Sub { result, err } => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribe
                    .clone();
                if let Some(handler) = handler {
                    handler(&result, err.as_ref());
                }
            }
            Notification::Unsub { filters, err } => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unsubscribe
                    .clone();
                if let Some(handler) = handler {
                    handler(&filters, err.as_ref());
                }
            }
            Notification::Net { server, err } => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .net
                    .clone();
                if let Some(handler) = handler {
                    handler(&server, &err);
                }
            }
            Notification::Persist { err } => {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .persist
                    .clone();
                if let Some(handler) = handler {
                    handler(&err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_requires_a_server() {
        assert!(matches!(
            Client::new(ClientConfig::new()),
            Err(ClientError::NoServers)
        ));
        assert!(Client::new(ClientConfig::new().server("localhost:1883")).is_ok());
    }

    #[tokio::test]
    async fn publish_reserves_id_and_persists() {
        use crate::persist::{MemPersist, PersistStore, Strategy};

        let persist = Arc::new(MemPersist::new(Strategy::default()));
        let client = Client::new(
            ClientConfig::new()
                .server("localhost:1883")
                .buf(4, 4)
                .persist(Arc::clone(&persist) as Arc<dyn PersistStore>),
        )
        .unwrap();

        client
            .publish(Publish::new("a/b", QoS::AtLeastOnce, "hi"))
            .await;

        assert_eq!(client.in_flight(), 1);
        assert!(persist.load("S1").is_some());

        // QoS 0 takes no identifier and is not persisted.
        client
            .publish(Publish::new("a/b", QoS::AtMostOnce, "hi"))
            .await;
        assert_eq!(client.in_flight(), 1);
    }

    #[tokio::test]
    async fn destroy_force_cancels_quietly() {
        let client = Client::new(ClientConfig::new().server("localhost:1883")).unwrap();
        client.destroy(true).await;
        // Publishing after destroy is a no-op.
        client
            .publish(Publish::new("t", QoS::AtLeastOnce, "x"))
            .await;
        assert_eq!(client.in_flight(), 0);
        client.wait().await;
    }
}
