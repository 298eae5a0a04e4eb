//! TLS transport listener
//!
//! Accepts TCP connections, terminates TLS and serves HTTP/1.1 with upgrade
//! support on each one. A failure on one connection never stops the accept
//! loop.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use matrix_observability::connection_span;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, warn, Instrument};

use crate::error::{GatewayError, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a client to finish sending a request head
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Load a PEM certificate chain and private key into a server config.
///
/// Any problem with the material is fatal: no listener should start with a
/// half-valid identity.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = read_certs(cert_path)?;
    let key = read_private_key(key_path)?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    // WebSocket upgrade is an HTTP/1.1 mechanism
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| GatewayError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source| GatewayError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(GatewayError::InvalidCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| GatewayError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| GatewayError::MissingPrivateKey(path.to_path_buf()))
}

/// Bound TCP socket plus the TLS acceptor for it
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl TlsListener {
    pub async fn bind(addr: SocketAddr, tls: Arc<ServerConfig>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            local_addr,
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` is cancelled.
    pub async fn serve(self, router: Router, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (stream, remote) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let router = router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(
                async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls)) => serve_connection(tls, remote, router, shutdown).await,
                        Ok(Err(e)) => warn!("TLS handshake failed: {}", e),
                        Err(_) => warn!("TLS handshake timed out"),
                    }
                }
                .instrument(connection_span(remote)),
            );
        }

        info!(addr = %self.local_addr, "listener stopped");
        Ok(())
    }
}

/// Serve HTTP with upgrades on an already-established transport.
///
/// The remote address is exposed to handlers as `ConnectInfo<SocketAddr>`.
/// A client that sends no complete request head within
/// [`HEADER_READ_TIMEOUT`] is disconnected.
pub async fn serve_connection<IO>(
    io: IO,
    remote: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let first_request = CancellationToken::new();
    let service = {
        let first_request = first_request.clone();
        hyper::service::service_fn(move |mut request: Request<Incoming>| {
            first_request.cancel();
            request.extensions_mut().insert(ConnectInfo(remote));
            router.clone().call(request)
        })
    };

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("connection error: {}", e);
            }
        }
        // protocol detection waits for bytes before hyper's own header timer starts
        _ = first_request_deadline(&first_request) => {
            debug!("no request within {:?}, dropping connection", HEADER_READ_TIMEOUT);
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(DRAIN_TIMEOUT, conn).await {
                Ok(Err(e)) => debug!("connection error during shutdown: {}", e),
                Err(_) => debug!("connection did not drain in time"),
                Ok(Ok(())) => {}
            }
        }
    }
}

/// Resolves only if no request arrives within [`HEADER_READ_TIMEOUT`].
async fn first_request_deadline(first_request: &CancellationToken) {
    if tokio::time::timeout(HEADER_READ_TIMEOUT, first_request.cancelled())
        .await
        .is_ok()
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    fn write_identity(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_load_valid_identity() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_identity(&dir);

        let config = load_tls_config(&cert, &key).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_certificate_file() {
        let dir = TempDir::new().unwrap();
        let (_, key) = write_identity(&dir);

        let err = load_tls_config(&dir.path().join("absent.crt"), &key).unwrap_err();
        assert!(matches!(err, GatewayError::TlsMaterial { .. }));
    }

    #[test]
    fn test_file_without_certificates() {
        let dir = TempDir::new().unwrap();
        let (_, key) = write_identity(&dir);

        // a key file holds no CERTIFICATE blocks
        let err = load_tls_config(&key, &key).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCertificate(_)));
    }

    #[test]
    fn test_file_without_private_key() {
        let dir = TempDir::new().unwrap();
        let (cert, _) = write_identity(&dir);

        let err = load_tls_config(&cert, &cert).unwrap_err();
        assert!(matches!(err, GatewayError::MissingPrivateKey(_)));
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_identity(&dir);
        let tls = load_tls_config(&cert, &key).unwrap();

        let listener = TlsListener::bind("127.0.0.1:0".parse().unwrap(), tls)
            .await
            .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_is_disconnected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(
            server,
            remote(),
            Router::new(),
            CancellationToken::new(),
        ));

        let started = Instant::now();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(HEADER_READ_TIMEOUT * 2, client.read_to_end(&mut buf)).await;

        assert!(matches!(read, Ok(Ok(0))));
        assert!(started.elapsed() >= HEADER_READ_TIMEOUT);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_request_head_is_disconnected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(
            server,
            remote(),
            Router::new(),
            CancellationToken::new(),
        ));

        client.write_all(b"GET /ws HTTP/1.1\r\nHost: loc").await.unwrap();

        let mut buf = Vec::new();
        let read = tokio::time::timeout(HEADER_READ_TIMEOUT * 2, client.read_to_end(&mut buf)).await;
        assert!(read.is_ok());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_request_is_served() {
        let (mut client, server) = tokio::io::duplex(4096);
        let router = Router::new().route("/ping", axum::routing::get(|| async { "pong" }));
        let task = tokio::spawn(serve_connection(
            server,
            remote(),
            router,
            CancellationToken::new(),
        ));

        client
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(HEADER_READ_TIMEOUT, client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.ends_with("pong"), "{}", response);
        task.await.unwrap();
    }
}
