//! TLS wrapping for hub and peer streams
//!
//! The hub serves a freshly generated self-signed certificate and the peer
//! accepts any certificate. This keeps traffic off the wire in plain text
//! but does not authenticate the hub; development grade only.

use thiserror::Error;
use tokio_native_tls::{TlsAcceptor, TlsConnector};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("TLS setup failed: {0}")]
    NativeTls(#[from] native_tls::Error),
}

pub type TlsResult<T> = Result<T, TlsError>;

/// Acceptor backed by a self-signed certificate for `localhost` and `hostname`
pub fn self_signed_acceptor(hostname: &str) -> TlsResult<TlsAcceptor> {
    let mut names = vec!["localhost".to_string()];
    if !hostname.is_empty() && hostname != "localhost" {
        names.push(hostname.to_string());
    }

    let cert = rcgen::generate_simple_self_signed(names)?;
    let cert_pem = cert.serialize_pem()?;
    let key_pem = cert.serialize_private_key_pem();

    let identity = native_tls::Identity::from_pkcs8(cert_pem.as_bytes(), key_pem.as_bytes())?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;

    tracing::info!("Generated self-signed certificate for {}", hostname);
    Ok(TlsAcceptor::from(acceptor))
}

/// Connector that trusts any certificate and hostname
pub fn trust_all_connector() -> TlsResult<TlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    Ok(TlsConnector::from(connector))
}
