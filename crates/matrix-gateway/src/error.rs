//! Gateway error type

use std::path::PathBuf;

use crate::peer::PeerId;

/// Gateway-related errors
///
/// TLS material and bind errors are startup-fatal. Everything else is local
/// to a single connection or peer and is logged rather than propagated.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Failed to read TLS material {path:?}: {source}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificate found in {0:?}")]
    InvalidCertificate(PathBuf),
    #[error("No private key found in {0:?}")]
    MissingPrivateKey(PathBuf),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Peer already registered: {0}")]
    DuplicatePeer(PeerId),
    #[error("Peer already closed: {0}")]
    PeerClosed(PeerId),
    #[error("Registry is closed")]
    RegistryClosed,
    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
