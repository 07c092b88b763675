//! Observability sink for poll cycles.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::cycle::CycleOutcome;

/// Receives per-cycle results and scheduler backpressure events.
pub trait CycleObserver: Send + Sync {
    fn on_cycle(&self, outcome: &CycleOutcome);

    /// A tick fired while a cycle was still running and was skipped.
    fn on_tick_skipped(&self) {}
}

/// Logs outcomes through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CycleObserver for TracingObserver {
    fn on_cycle(&self, outcome: &CycleOutcome) {
        if let Some(e) = &outcome.error {
            error!(
                cycle_id = %outcome.cycle_id,
                protocol = %outcome.protocol,
                kind = e.kind(),
                error = %e,
                listed = outcome.listed,
                delivered = outcome.delivered,
                "Poll cycle failed"
            );
        } else if outcome.listed > 0 {
            info!(
                cycle_id = %outcome.cycle_id,
                protocol = %outcome.protocol,
                listed = outcome.listed,
                delivered = outcome.delivered,
                rejected = outcome.rejected,
                failed = outcome.failed,
                skipped = outcome.skipped,
                deferred = outcome.deferred,
                elapsed_ms = outcome.elapsed().num_milliseconds(),
                "Poll cycle complete"
            );
        } else {
            debug!(cycle_id = %outcome.cycle_id, "Poll cycle found no messages");
        }
    }

    fn on_tick_skipped(&self) {
        warn!("Poll tick skipped: previous cycle still running");
    }
}

/// Running totals across cycles.
#[derive(Debug, Default)]
pub struct PollStats {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    failed_messages: AtomicU64,
    ticks_skipped: AtomicU64,
}

/// Point-in-time copy of [`PollStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub failed_messages: u64,
    pub ticks_skipped: u64,
}

impl PollStats {
    pub fn record(&self, outcome: &CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if outcome.error.is_some() {
            self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.rejected
            .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
        self.failed_messages
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
    }

    pub fn record_skipped_tick(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed_messages: self.failed_messages.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
        }
    }
}
