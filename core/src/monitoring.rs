//! Monitoring (spec.md SPEC_FULL.md supplement): structured events and
//! counters for the conditions the router, registry, and planner need
//! visibility into, rather than the teacher's full host telemetry.
//!
//! The teacher's `MetricsCollector` (`core::monitoring`) polled CPU,
//! memory, disk, and network every few seconds and raised threshold
//! alerts off of them — none of that has a counterpart in this crate's
//! scope. What's kept is the shape: counters behind atomics, a
//! dedicated background loop, and `tracing` events at the moment
//! something interesting happens, which is how the teacher's
//! `Alert`/`AlertLevel` pipeline ultimately surfaced problems too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::store::Store;

const DEGRADED_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct Monitoring {
    tier_downgrades: AtomicU64,
    hmac_failures: AtomicU64,
    queue_full: AtomicU64,
    late_responses: AtomicU64,
    circuit_opens: AtomicU64,
}

impl Monitoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tier_downgrade(&self, target: &str) {
        self.tier_downgrades.fetch_add(1, Ordering::Relaxed);
        info!(target = target, "tier_downgrade");
    }

    pub fn record_hmac_failure(&self) {
        self.hmac_failures.fetch_add(1, Ordering::Relaxed);
        warn!("hmac_failure");
    }

    pub fn record_queue_full(&self, target: &str) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
        warn!(target = target, "queue_full");
    }

    pub fn record_late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_open(&self, target: &str) {
        self.circuit_opens.fetch_add(1, Ordering::Relaxed);
        warn!(target = target, "circuit_breaker_open");
    }

    pub fn record_circuit_close(&self, target: &str) {
        info!(target = target, "circuit_breaker_close");
    }

    pub fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            tier_downgrades: self.tier_downgrades.load(Ordering::Relaxed),
            hmac_failures: self.hmac_failures.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
        }
    }

    /// Emits a `store_unavailable` event every [`DEGRADED_POLL_INTERVAL`]
    /// while the store reports degraded, until `cancel` is notified
    /// (spec.md §7).
    pub async fn run_degraded_store_watch(self: Arc<Self>, store: Arc<dyn Store>, cancel: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = cancel.notified() => break,
                _ = tokio::time::sleep(DEGRADED_POLL_INTERVAL) => {
                    if store.is_degraded() {
                        error!("store_unavailable: core is running in degraded mode");
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitoringSnapshot {
    pub tier_downgrades: u64,
    pub hmac_failures: u64,
    pub queue_full: u64,
    pub late_responses: u64,
    pub circuit_opens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Monitoring::new();
        m.record_tier_downgrade("worker-1");
        m.record_hmac_failure();
        m.record_hmac_failure();
        let snap = m.snapshot();
        assert_eq!(snap.tier_downgrades, 1);
        assert_eq!(snap.hmac_failures, 2);
    }
}
