//! Matrix Gateway - TLS WebSocket gateway with liveness eviction
//!
//! Terminates TLS, upgrades HTTP requests on a configured path to WebSocket,
//! tracks every upgraded peer in a shared registry, and evicts peers that
//! stop answering periodic pings.

mod bridge;
mod error;
mod gateway;
mod listener;
mod monitor;
mod peer;
mod registry;

pub use bridge::{
    build_router, run_peer, static_json, BridgeState, InboundFrame, InboundHandler, LogInbound,
};
pub use error::{GatewayError, Result};
pub use gateway::{BoundGateway, Gateway, GatewayConfig, ShutdownHandle};
pub use listener::{load_tls_config, serve_connection, TlsListener};
pub use monitor::{LivenessMonitor, LivenessPolicy, MonitorHandle};
pub use peer::{PeerCommand, PeerHandle, PeerId, PeerMailbox};
pub use registry::{ConnectionRegistry, SweepReport};
