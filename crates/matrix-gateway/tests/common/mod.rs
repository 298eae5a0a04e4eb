#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use matrix_gateway::{
    build_router, serve_connection, static_json, BridgeState, ConnectionRegistry, InboundHandler,
    LivenessMonitor, LivenessPolicy, MonitorHandle,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const PERIOD: Duration = Duration::from_millis(100);

/// Gateway served over plain TCP, for tests that do not care about TLS
pub struct PlainGateway {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub shutdown: CancellationToken,
    pub monitor: Option<MonitorHandle>,
}

impl PlainGateway {
    /// Serve without a liveness monitor
    pub async fn start() -> Self {
        Self::start_with(None, None).await
    }

    /// Serve without a monitor, handing application frames to `inbound`
    pub async fn start_with_inbound(inbound: Arc<dyn InboundHandler>) -> Self {
        Self::start_with(None, Some(inbound)).await
    }

    /// Serve with a liveness monitor ticking every [`PERIOD`]
    pub async fn start_monitored() -> Self {
        Self::start_with(Some(monitored_policy()), None).await
    }

    /// Serve with a monitor running `policy` (if any) and an optional handler
    pub async fn start_with(
        policy: Option<LivenessPolicy>,
        inbound: Option<Arc<dyn InboundHandler>>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let shutdown = CancellationToken::new();
        let mut state = BridgeState::new(
            registry.clone(),
            policy.clone().unwrap_or_default(),
            shutdown.clone(),
        );
        if let Some(inbound) = inbound {
            state = state.with_inbound(inbound);
        }
        let router = build_router(
            state,
            "/ws",
            static_json("/api/config", json!({ "name": "matrix", "peers": [] })),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted.unwrap(),
                };
                tokio::spawn(serve_connection(
                    stream,
                    remote,
                    router.clone(),
                    accept_shutdown.clone(),
                ));
            }
        });

        let monitor =
            policy.map(|policy| LivenessMonitor::new(registry.clone(), policy).spawn(&shutdown));

        Self {
            addr,
            registry,
            shutdown,
            monitor,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn stop(mut self) -> usize {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        self.registry.close_all()
    }
}

/// Default policy with the period shortened to [`PERIOD`]
pub fn monitored_policy() -> LivenessPolicy {
    LivenessPolicy {
        period: PERIOD,
        ..LivenessPolicy::default()
    }
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Send a raw HTTP/1.1 request and read until the server closes
pub async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}
