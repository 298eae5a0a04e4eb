//! Gateway main structure
//!
//! Wires the TLS listener, upgrade bridge, connection registry and liveness
//! monitor together and owns the shutdown signal shared by all of them.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::{build_router, BridgeState, InboundHandler, LogInbound};
use crate::error::Result;
use crate::listener::{load_tls_config, TlsListener};
use crate::monitor::{LivenessMonitor, LivenessPolicy};
use crate::registry::ConnectionRegistry;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address (e.g., "0.0.0.0:4000")
    pub bind: String,
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key
    pub key_path: PathBuf,
    /// Path that accepts WebSocket upgrades
    pub upgrade_path: String,
    pub liveness: LivenessPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&matrix_config::Config::default())
    }
}

impl From<&matrix_config::Config> for GatewayConfig {
    fn from(config: &matrix_config::Config) -> Self {
        Self {
            bind: config.bind_addr(),
            cert_path: config.tls.cert_path.clone(),
            key_path: config.tls.key_path.clone(),
            upgrade_path: config.gateway.upgrade_path.clone(),
            liveness: LivenessPolicy::from(&config.gateway),
        }
    }
}

/// Cloneable trigger for a gateway's shutdown
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The gateway before its socket is bound
pub struct Gateway {
    config: GatewayConfig,
    registry: ConnectionRegistry,
    routes: Router,
    inbound: Arc<dyn InboundHandler>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("inbound", &"<handler>")
            .finish()
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            routes: Router::new(),
            inbound: Arc::new(LogInbound),
            shutdown: CancellationToken::new(),
        }
    }

    /// Merge extra routes (e.g. a [`static_json`](crate::static_json) document).
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    pub fn with_inbound_handler(mut self, handler: impl InboundHandler + 'static) -> Self {
        self.inbound = Arc::new(handler);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// The full HTTP router, usable without TLS
    pub fn router(&self) -> Router {
        let state = BridgeState::new(
            self.registry.clone(),
            self.config.liveness.clone(),
            self.shutdown.clone(),
        )
        .with_inbound(Arc::clone(&self.inbound));
        build_router(state, &self.config.upgrade_path, self.routes.clone())
    }

    /// Load TLS material and bind the socket. Both failures are fatal.
    pub async fn bind(self) -> Result<BoundGateway> {
        let tls = load_tls_config(&self.config.cert_path, &self.config.key_path)?;
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TlsListener::bind(addr, tls).await?;
        info!("listening on {}", listener.local_addr());

        Ok(BoundGateway {
            router: self.router(),
            listener,
            registry: self.registry,
            policy: self.config.liveness,
            shutdown: self.shutdown,
        })
    }

    /// Bind, then serve until shut down.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.run().await
    }
}

/// A gateway with its socket bound, ready to serve
#[derive(Debug)]
pub struct BoundGateway {
    listener: TlsListener,
    router: Router,
    registry: ConnectionRegistry,
    policy: LivenessPolicy,
    shutdown: CancellationToken,
}

impl BoundGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Serve until shutdown, then stop the monitor and close every peer.
    pub async fn run(self) -> Result<()> {
        let monitor =
            LivenessMonitor::new(self.registry.clone(), self.policy).spawn(&self.shutdown);

        let served = self.listener.serve(self.router, self.shutdown.clone()).await;

        let cycles = monitor.stop().await;
        let closed = self.registry.close_all();
        info!(cycles, closed, "gateway stopped");
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_from_matrix_config() {
        let mut config = matrix_config::Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 8443;
        config.gateway.upgrade_path = "/live".to_string();
        config.gateway.probe_interval_ms = 500;

        let gateway = GatewayConfig::from(&config);
        assert_eq!(gateway.bind, "127.0.0.1:8443");
        assert_eq!(gateway.upgrade_path, "/live");
        assert_eq!(gateway.liveness.period, Duration::from_millis(500));
        assert_eq!(gateway.cert_path, PathBuf::from("server.crt"));
    }

    #[test]
    fn test_shutdown_handle() {
        let gateway = Gateway::new(GatewayConfig::default());
        let handle = gateway.shutdown_handle();
        assert!(!handle.is_shutdown());

        handle.clone().shutdown();
        assert!(gateway.shutdown_handle().is_shutdown());
    }

    #[tokio::test]
    async fn test_bind_fails_without_tls_material() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = Gateway::new(GatewayConfig {
            bind: "127.0.0.1:0".to_string(),
            cert_path: dir.path().join("missing.crt"),
            key_path: dir.path().join("missing.key"),
            ..GatewayConfig::default()
        });

        tokio_test::assert_err!(gateway.bind().await);
    }
}
