//! Upgrade bridge
//!
//! Routes HTTP requests on the upgrade path through the WebSocket handshake,
//! registers each upgraded socket as a peer, and runs one actor task per peer
//! until the transport goes away.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use matrix_config::HEALTH_ROUTE;
use matrix_observability::peer_span;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::monitor::LivenessPolicy;
use crate::peer::{PeerCommand, PeerHandle, PeerId, PeerMailbox};
use crate::registry::ConnectionRegistry;

const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Application frame received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl InboundFrame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives application frames from every peer.
///
/// Runs inline in the peer's actor task, so a slow handler delays that
/// peer's pongs as well.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_frame(&self, peer: &PeerId, frame: InboundFrame);
}

/// Default handler: log and drop
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInbound;

#[async_trait]
impl InboundHandler for LogInbound {
    async fn on_frame(&self, _peer: &PeerId, frame: InboundFrame) {
        info!(bytes = frame.len(), "got a message");
    }
}

/// Shared state for the upgrade and health handlers
#[derive(Clone)]
pub struct BridgeState {
    pub registry: ConnectionRegistry,
    pub policy: LivenessPolicy,
    pub inbound: Arc<dyn InboundHandler>,
    pub shutdown: CancellationToken,
}

impl fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeState")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("inbound", &"<handler>")
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl BridgeState {
    pub fn new(
        registry: ConnectionRegistry,
        policy: LivenessPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            policy,
            inbound: Arc::new(LogInbound),
            shutdown,
        }
    }

    pub fn with_inbound(mut self, inbound: Arc<dyn InboundHandler>) -> Self {
        self.inbound = inbound;
        self
    }
}

/// Build the gateway router.
///
/// Any method on `upgrade_path` reaches the upgrade handler so that every
/// malformed handshake gets the same treatment. `extra` is merged last and
/// must not reuse either built-in path.
pub fn build_router(state: BridgeState, upgrade_path: &str, extra: Router) -> Router {
    Router::new()
        .route(upgrade_path, any(upgrade_handler))
        .route(HEALTH_ROUTE, get(health_handler))
        .with_state(state)
        .merge(extra)
}

/// Serve a fixed JSON document on `route`. Has no access to the registry.
pub fn static_json(route: &str, value: Value) -> Router {
    let document = Arc::new(value);
    Router::new().route(
        route,
        get(move || {
            let document = Arc::clone(&document);
            async move { Json((*document).clone()) }
        }),
    )
}

async fn health_handler(State(state): State<BridgeState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "peers": state.registry.size(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn upgrade_handler(
    State(state): State<BridgeState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(remote = ?remote, "rejected upgrade: {}", rejection.body_text());
            return closing_response(rejection.status(), rejection.body_text());
        }
    };

    if state.shutdown.is_cancelled() {
        return closing_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Gateway is shutting down".to_string(),
        );
    }

    upgrade
        .on_failed_upgrade(move |e| {
            warn!(remote = ?remote, "WebSocket upgrade failed: {}", e);
        })
        .on_upgrade(move |socket| accept_peer(socket, remote, state))
}

/// Error response that also ends the HTTP connection
fn closing_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONNECTION, "close")], body).into_response()
}

async fn accept_peer(mut socket: WebSocket, remote: Option<SocketAddr>, state: BridgeState) {
    let (peer, mailbox) = PeerHandle::new(remote);
    let id = peer.id();
    let connected_at = peer.connected_at();

    if let Err(e) = state.registry.register(peer) {
        debug!(peer_id = %id, "discarding upgraded socket: {}", e);
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let span = peer_span(&id, remote);
    span.in_scope(|| info!(peers = state.registry.size(), "new connection"));
    run_peer(socket, id, mailbox, state).instrument(span.clone()).await;

    let lifetime = Utc::now().signed_duration_since(connected_at);
    span.in_scope(|| debug!(seconds = lifetime.num_seconds(), "peer session ended"));
}

/// Drive one registered peer until it closes.
///
/// Multiplexes the close signal, probe commands and inbound frames. Every
/// await inside the loop also yields to the close signal, so an evicted peer
/// loses its transport even while a send or the inbound handler is stuck.
/// Always unregisters `id` on the way out.
pub async fn run_peer(socket: WebSocket, id: PeerId, mailbox: PeerMailbox, state: BridgeState) {
    let (mut sender, mut receiver) = socket.split();
    let (mut commands, close) = mailbox.into_parts();
    let mut close_frame = None;

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            command = commands.recv() => match command {
                Some(PeerCommand::Probe) => {
                    match unless_closed(&close, sender.send(Message::Ping(Vec::new()))).await {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            debug!("probe send failed: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                None => break,
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Pong(_))) => {
                    state.registry.mark_responsive(&id);
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Text(text))) => {
                    let delivered = deliver(&state, &id, InboundFrame::Text(text));
                    if unless_closed(&close, delivered).await.is_none() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let delivered = deliver(&state, &id, InboundFrame::Binary(data));
                    if unless_closed(&close, delivered).await.is_none() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    close_frame = frame;
                    break;
                }
                Some(Err(e)) => {
                    debug!("transport error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    if close.is_cancelled() {
        // a peer that stopped reading must not hold the task open
        if tokio::time::timeout(CLOSE_SEND_TIMEOUT, sender.send(Message::Close(None)))
            .await
            .is_err()
        {
            debug!("close frame not sent in time, dropping transport");
        }
    }
    // both halves dropped here, which closes the transport
    drop((sender, receiver));

    state.registry.unregister(&id);
    match close_frame {
        Some(frame) => info!(
            code = u16::from(frame.code),
            reason = %frame.reason,
            peers = state.registry.size(),
            "connection closed"
        ),
        None => info!(peers = state.registry.size(), "connection closed"),
    }
}

/// Await `fut` unless the peer is closed first; `None` means closed.
async fn unless_closed<F: Future>(close: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = close.cancelled() => None,
        output = fut => Some(output),
    }
}

async fn deliver(state: &BridgeState, id: &PeerId, frame: InboundFrame) {
    if state.policy.any_frame_counts {
        state.registry.mark_responsive(id);
    }
    state.inbound.on_frame(id, frame).await;
}
