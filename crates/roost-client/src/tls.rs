//! TLS plumbing for secure servers, built on rustls.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;

use crate::config::TlsOptions;
use crate::error::{ClientError, Result};

/// Build a connector for the configured TLS material.
pub(crate) fn connector(options: &TlsOptions) -> Result<TlsConnector> {
    let config = match options {
        TlsOptions::Prebuilt(config) => return Ok(TlsConnector::from(Arc::clone(config))),
        TlsOptions::SystemRoots => system_roots_config()?,
        TlsOptions::Files {
            cert,
            key,
            ca,
            skip_verify,
            ..
        } => {
            let ca_pem = std::fs::read(ca)
                .map_err(|e| ClientError::Tls(format!("failed to read CA file: {e}")))?;
            let cert_pem = std::fs::read(cert)
                .map_err(|e| ClientError::Tls(format!("failed to read cert file: {e}")))?;
            let key_pem = read_key_file(key)?;
            pem_config(&cert_pem, &key_pem, &ca_pem, *skip_verify)?
        }
        TlsOptions::Pem {
            cert,
            key,
            ca,
            skip_verify,
            ..
        } => pem_config(cert, key, ca, *skip_verify)?,
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The SNI name for a connection: the configured override, or the host
/// part of the dialed address.
pub(crate) fn server_name(addr: &str, options: &TlsOptions) -> Result<ServerName<'static>> {
    let configured = match options {
        TlsOptions::Files { server_name, .. } | TlsOptions::Pem { server_name, .. } => {
            server_name.as_deref()
        }
        _ => None,
    };
    let host = configured.unwrap_or_else(|| addr.split(':').next().unwrap_or("localhost"));

    ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::Tls(format!("invalid server name {host:?}")))
}

fn system_roots_config() -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn read_key_file(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| ClientError::Tls(format!("failed to read key file: {e}")))
}

fn pem_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
    skip_verify: bool,
) -> Result<rustls::ClientConfig> {
    if skip_verify {
        return insecure_config(cert_pem, key_pem);
    }

    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(ca_pem);
    let cas = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("failed to parse CA cert: {e}")))?;
    for ca in cas {
        roots
            .add(ca)
            .map_err(|e| ClientError::Tls(format!("failed to add CA cert: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    if cert_pem.is_empty() {
        return Ok(builder.with_no_client_auth());
    }

    let (certs, key) = client_auth_material(cert_pem, key_pem)?;
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClientError::Tls(format!("failed to configure client auth: {e}")))
}

fn client_auth_material(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(cert_pem);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("failed to parse client cert: {e}")))?;

    let mut key_reader = BufReader::new(key_pem);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ClientError::Tls(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| ClientError::Tls("no private key found".to_string()))?;

    Ok((certs, key))
}

/// Accept any server certificate. Only reachable through an explicit
/// `skip_verify`.
fn insecure_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification));

    if cert_pem.is_empty() {
        return Ok(builder.with_no_client_auth());
    }

    let (certs, key) = client_auth_material(cert_pem, key_pem)?;
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClientError::Tls(format!("failed to configure client auth: {e}")))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_prefers_the_override() {
        let options = TlsOptions::Pem {
            cert: Vec::new(),
            key: Vec::new(),
            ca: Vec::new(),
            server_name: Some("broker.internal".into()),
            skip_verify: true,
        };
        let name = server_name("10.0.0.7:8883", &options).unwrap();
        assert_eq!(
            name,
            ServerName::try_from("broker.internal".to_string()).unwrap()
        );
    }

    #[test]
    fn server_name_falls_back_to_the_host() {
        let name = server_name("broker.example.com:8883", &TlsOptions::SystemRoots).unwrap();
        assert_eq!(
            name,
            ServerName::try_from("broker.example.com".to_string()).unwrap()
        );
    }

    #[test]
    fn system_roots_connector_builds() {
        assert!(connector(&TlsOptions::SystemRoots).is_ok());
    }

    #[test]
    fn skip_verify_connector_builds_without_material() {
        let options = TlsOptions::Pem {
            cert: Vec::new(),
            key: Vec::new(),
            ca: Vec::new(),
            server_name: None,
            skip_verify: true,
        };
        assert!(connector(&options).is_ok());
    }
}
