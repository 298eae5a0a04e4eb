//! Peer handles
//!
//! A [`PeerHandle`] is the registry's view of one upgraded connection. The
//! socket itself is owned by the connection task; the handle only carries a
//! command channel into that task and a close signal.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Opaque peer identity, unique for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Requests sent from the gateway to a peer's connection task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// Send a liveness probe (WebSocket ping)
    Probe,
}

/// Cloneable handle to an upgraded connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    close: CancellationToken,
}

/// Receiving half owned by the connection task
#[derive(Debug)]
pub struct PeerMailbox {
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    close: CancellationToken,
}

impl PeerHandle {
    /// Create a handle with a fresh id and the mailbox its connection task reads.
    pub fn new(remote_addr: Option<SocketAddr>) -> (Self, PeerMailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let handle = Self {
            id: PeerId::new(),
            remote_addr,
            connected_at: Utc::now(),
            commands: tx,
            close: close.clone(),
        };
        let mailbox = PeerMailbox {
            commands: rx,
            close,
        };
        (handle, mailbox)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a liveness probe for the connection task.
    ///
    /// Fails once the peer is closed or its task has exited.
    pub fn probe(&self) -> Result<()> {
        if self.close.is_cancelled() {
            return Err(GatewayError::ChannelClosed);
        }
        self.commands
            .send(PeerCommand::Probe)
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Ask the connection task to close the transport. Repeated calls are no-ops.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// True once closed locally or once the connection task has gone away
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.commands.is_closed()
    }
}

impl PeerMailbox {
    /// Next command, or `None` when every handle has been dropped
    pub async fn recv(&mut self) -> Option<PeerCommand> {
        self.commands.recv().await
    }

    /// Drain queued probes without waiting, returning how many there were
    pub fn take_probes(&mut self) -> usize {
        let mut count = 0;
        while let Ok(PeerCommand::Probe) = self.commands.try_recv() {
            count += 1;
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub(crate) fn into_parts(self) -> (mpsc::UnboundedReceiver<PeerCommand>, CancellationToken) {
        (self.commands, self.close)
    }
}
