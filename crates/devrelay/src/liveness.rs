//! Periodic probe-and-evict sweep over every authenticated connection.
//!
//! Each sweep evicts connections that did not answer the previous probe and
//! sends a fresh probe to the rest, so an unresponsive connection is dropped
//! after at most one full period of silence.

use crate::connection::{ConnId, Connection};
use crate::metrics::counters;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Interval between liveness sweeps.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Connections that were sent a new probe.
    pub probed: usize,
    /// Connections terminated for missing the previous probe.
    pub evicted: usize,
}

/// Tracks authenticated connections and evicts unresponsive ones.
#[derive(Debug)]
pub struct LivenessMonitor {
    tracked: DashMap<ConnId, Arc<Connection>>,
    period: Duration,
}

impl LivenessMonitor {
    /// Monitor sweeping every [`PROBE_INTERVAL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_period(PROBE_INTERVAL)
    }

    /// Monitor with a custom sweep period. Intended for tests.
    #[must_use]
    pub fn with_period(period: Duration) -> Self {
        Self {
            tracked: DashMap::new(),
            period,
        }
    }

    /// Sweep period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start tracking a connection.
    pub fn track(&self, conn: Arc<Connection>) {
        self.tracked.insert(conn.id(), conn);
    }

    /// Stop tracking a connection. No-op if it is not tracked.
    pub fn untrack(&self, id: ConnId) {
        self.tracked.remove(&id);
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Run one probe cycle over every tracked connection.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        self.tracked.retain(|_, conn| {
            if conn.probe() {
                stats.probed += 1;
                true
            } else {
                conn.terminate();
                stats.evicted += 1;
                tracing::debug!(conn_id = conn.id(), peer = %conn.peer(), "evicting unresponsive connection");
                false
            }
        });
        if stats.evicted > 0 {
            counters::evictions_total(stats.evicted as u64);
        }
        stats
    }

    /// Terminate and forget every tracked connection.
    pub fn terminate_all(&self) -> usize {
        let mut terminated = 0;
        self.tracked.retain(|_, conn| {
            conn.terminate();
            terminated += 1;
            false
        });
        terminated
    }

    /// Spawn the sweep loop. The first sweep runs one period after start.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.period;
            tracing::info!("liveness monitor started (interval: {:?})", period);

            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                let stats = self.sweep();
                if stats.evicted > 0 {
                    tracing::info!(
                        probed = stats.probed,
                        evicted = stats.evicted,
                        "liveness sweep evicted connections"
                    );
                } else {
                    tracing::debug!(probed = stats.probed, "liveness sweep");
                }
            }
        })
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
