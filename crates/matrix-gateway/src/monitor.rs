//! Liveness monitor
//!
//! Once per period: evict every peer that did not answer the previous
//! probe, reset the responsive set, then probe the survivors. A peer that
//! stays silent for one full period is gone by the start of the next cycle.
//! There is no backoff and no multi-probe grace.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionRegistry, SweepReport};

/// Liveness tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Cycle length
    pub period: Duration,
    /// Re-admit a peer as soon as its probe is dispatched instead of waiting
    /// for the pong. Adds one cycle of tolerance before eviction.
    pub optimistic_admission: bool,
    /// Count inbound text/binary frames as proof of liveness, not only pongs
    pub any_frame_counts: bool,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            optimistic_admission: false,
            any_frame_counts: false,
        }
    }
}

impl From<&matrix_config::GatewayConfig> for LivenessPolicy {
    fn from(config: &matrix_config::GatewayConfig) -> Self {
        Self {
            period: Duration::from_millis(config.probe_interval_ms),
            optimistic_admission: config.optimistic_admission,
            any_frame_counts: config.any_frame_counts,
        }
    }
}

/// Periodic evict/reset/probe driver
#[derive(Debug)]
pub struct LivenessMonitor {
    registry: ConnectionRegistry,
    policy: LivenessPolicy,
    cycles: u64,
}

impl LivenessMonitor {
    pub fn new(registry: ConnectionRegistry, policy: LivenessPolicy) -> Self {
        Self {
            registry,
            policy,
            cycles: 0,
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one cycle immediately.
    pub fn run_cycle(&mut self) -> SweepReport {
        self.cycles += 1;
        let report = self.registry.sweep(self.policy.optimistic_admission);

        if !report.evicted.is_empty() {
            info!(
                cycle = self.cycles,
                evicted = report.evicted.len(),
                remaining = report.remaining,
                "evicted unresponsive peers"
            );
        }
        debug!(
            cycle = self.cycles,
            probed = report.probed,
            probe_failures = report.probe_failures,
            "liveness cycle complete"
        );
        report
    }

    /// Run cycles on a timer until `shutdown` is cancelled or the returned
    /// handle is stopped. The first cycle runs one period after spawning.
    pub fn spawn(self, shutdown: &CancellationToken) -> MonitorHandle {
        let stop = shutdown.child_token();
        let task = tokio::spawn(self.run(stop.clone()));
        MonitorHandle { stop, task }
    }

    async fn run(mut self, stop: CancellationToken) -> u64 {
        let period = self.policy.period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(period_ms = period.as_millis() as u64, "liveness monitor started");
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle();
                }
            }
        }
        info!(cycles = self.cycles, "liveness monitor stopped");
        self.cycles
    }
}

/// Stop handle for a spawned [`LivenessMonitor`]
#[derive(Debug)]
pub struct MonitorHandle {
    stop: CancellationToken,
    task: JoinHandle<u64>,
}

impl MonitorHandle {
    /// Stop the timer and wait for the in-flight cycle to finish.
    /// Returns the number of completed cycles, or 0 if the task died.
    pub async fn stop(self) -> u64 {
        self.stop.cancel();
        match self.task.await {
            Ok(cycles) => cycles,
            Err(e) => {
                warn!("liveness monitor task failed: {}", e);
                0
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
