//! Connection registry
//!
//! The single source of truth for which peers are connected, plus the
//! responsive set consulted by the liveness monitor. Both live behind one
//! lock so that every membership change is a single step for other tasks,
//! and no lock is ever held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::peer::{PeerHandle, PeerId};

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<PeerId, PeerHandle>,
    responsive: HashSet<PeerId>,
    closed: bool,
}

/// Outcome of one evict/reset/probe cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers removed because they did not answer the previous probe
    pub evicted: Vec<PeerId>,
    /// Survivors whose probe was dispatched
    pub probed: usize,
    /// Survivors whose probe could not be dispatched
    pub probe_failures: usize,
    /// Registry size once the cycle finished
    pub remaining: usize,
}

/// Shared set of live peers
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly upgraded peer.
    ///
    /// The peer joins the responsive set straight away, so the first cycle
    /// after it joins probes it instead of evicting it.
    pub fn register(&self, peer: PeerHandle) -> Result<()> {
        let id = peer.id();
        if peer.is_closed() {
            return Err(GatewayError::PeerClosed(id));
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GatewayError::RegistryClosed);
        }
        if inner.peers.contains_key(&id) {
            return Err(GatewayError::DuplicatePeer(id));
        }
        inner.responsive.insert(id);
        inner.peers.insert(id, peer);
        debug!(peer_id = %id, peers = inner.peers.len(), "peer registered");
        Ok(())
    }

    /// Remove a peer and close its transport.
    ///
    /// Returns `false` when the peer was not registered; calling this twice
    /// for the same peer is harmless.
    pub fn unregister(&self, id: &PeerId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner.responsive.remove(id);
            inner.peers.remove(id)
        };

        match removed {
            Some(peer) => {
                peer.close();
                debug!(peer_id = %id, "peer unregistered");
                true
            }
            None => false,
        }
    }

    /// Record that a peer answered a probe (or otherwise showed it is alive).
    ///
    /// Unknown peers are ignored so a late pong cannot resurrect an evicted peer.
    pub fn mark_responsive(&self, id: &PeerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.peers.contains_key(id) {
            inner.responsive.insert(*id);
            true
        } else {
            false
        }
    }

    /// Apply `f` to a snapshot of current members.
    ///
    /// Members closed after the snapshot was taken are skipped.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&PeerHandle),
    {
        let snapshot: Vec<PeerHandle> = self.inner.lock().peers.values().cloned().collect();
        for peer in snapshot.iter().filter(|peer| !peer.is_closed()) {
            f(peer);
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.inner.lock().peers.contains_key(id)
    }

    pub fn is_responsive(&self, id: &PeerId) -> bool {
        self.inner.lock().responsive.contains(id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.lock().peers.keys().copied().collect()
    }

    /// Run one liveness cycle: evict, reset, probe.
    ///
    /// Evict and reset form one critical section. Probes are dispatched
    /// afterwards, outside the lock. With `optimistic` set, a successfully
    /// dispatched probe re-admits the peer immediately.
    pub fn sweep(&self, optimistic: bool) -> SweepReport {
        let (evicted, survivors) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let stale: Vec<PeerId> = inner
                .peers
                .keys()
                .filter(|id| !inner.responsive.contains(id))
                .copied()
                .collect();
            let evicted: Vec<PeerHandle> = stale
                .iter()
                .filter_map(|id| inner.peers.remove(id))
                .collect();

            inner.responsive.clear();

            let survivors: Vec<PeerHandle> = inner.peers.values().cloned().collect();
            (evicted, survivors)
        };

        for peer in &evicted {
            peer.close();
            info!(peer_id = %peer.id(), "evicting unresponsive peer");
        }

        let mut report = SweepReport {
            evicted: evicted.iter().map(PeerHandle::id).collect(),
            ..SweepReport::default()
        };

        for peer in &survivors {
            match peer.probe() {
                Ok(()) => {
                    report.probed += 1;
                    if optimistic {
                        self.mark_responsive(&peer.id());
                    }
                }
                Err(e) => {
                    report.probe_failures += 1;
                    debug!(peer_id = %peer.id(), "probe not dispatched: {}", e);
                }
            }
        }

        report.remaining = self.size();
        report
    }

    /// Refuse further registrations and close every registered peer.
    pub fn close_all(&self) -> usize {
        let peers: Vec<PeerHandle> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.responsive.clear();
            inner.peers.drain().map(|(_, peer)| peer).collect()
        };

        for peer in &peers {
            peer.close();
        }
        peers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
