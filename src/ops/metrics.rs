//! Coordinator metrics.
//!
//! Metric namespace: `idemgate.*`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod names {
    /// Requests passed through without coordination.
    pub const PASSTHROUGH_TOTAL: &str = "idemgate.coordinator.passthrough_total";
    /// Requests answered from a completed record.
    pub const REPLAY_TOTAL: &str = "idemgate.coordinator.replay_total";
    /// Requests rejected because the key was in flight.
    pub const CONFLICT_TOTAL: &str = "idemgate.coordinator.conflict_total";
    /// Requests that executed the protected operation under a lock.
    pub const EXECUTE_TOTAL: &str = "idemgate.coordinator.execute_total";
    /// Requests executed without the guarantee after a store failure.
    pub const UNGUARDED_TOTAL: &str = "idemgate.coordinator.unguarded_total";
    /// Requests rejected for an invalid key.
    pub const REJECTED_TOTAL: &str = "idemgate.coordinator.rejected_total";
    /// Executions recorded as completed.
    pub const COMPLETED_TOTAL: &str = "idemgate.store.completed_total";
    /// Executions aborted.
    pub const ABORTED_TOTAL: &str = "idemgate.store.aborted_total";
    /// Complete/abort/renew calls by a stale holder.
    pub const TOKEN_MISMATCH_TOTAL: &str = "idemgate.lock.token_mismatch_total";
    /// Lease renewals performed by stream heartbeats.
    pub const LEASE_RENEWALS_TOTAL: &str = "idemgate.lock.renewals_total";
    /// Captures abandoned for exceeding the size limit.
    pub const CAPTURE_OVERFLOW_TOTAL: &str = "idemgate.stream.capture_overflow_total";
    /// Streams currently being forwarded.
    pub const ACTIVE_STREAMS: &str = "idemgate.stream.active_streams";
}

/// Counters shared by the coordinator and the stream reconciler.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// Passthrough decisions.
    pub passthrough: AtomicU64,
    /// Replay decisions.
    pub replay: AtomicU64,
    /// Conflict decisions.
    pub conflict: AtomicU64,
    /// Execute decisions.
    pub execute: AtomicU64,
    /// Fail-open executions.
    pub unguarded: AtomicU64,
    /// Invalid-key rejections.
    pub rejected: AtomicU64,
    /// Successful completions.
    pub completed: AtomicU64,
    /// Aborts.
    pub aborted: AtomicU64,
    /// Stale-holder operations.
    pub token_mismatches: AtomicU64,
    /// Heartbeat renewals.
    pub lease_renewals: AtomicU64,
    /// Capture overflows.
    pub capture_overflows: AtomicU64,
    /// Streams in flight.
    pub active_streams: AtomicU64,
}

impl CoordinatorMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a passthrough.
    pub fn record_passthrough(&self) {
        Self::bump(&self.passthrough);
    }

    /// Record a replay.
    pub fn record_replay(&self) {
        Self::bump(&self.replay);
    }

    /// Record a conflict.
    pub fn record_conflict(&self) {
        Self::bump(&self.conflict);
    }

    /// Record a guarded execution.
    pub fn record_execute(&self) {
        Self::bump(&self.execute);
    }

    /// Record a fail-open execution.
    pub fn record_unguarded(&self) {
        Self::bump(&self.unguarded);
    }

    /// Record an invalid-key rejection.
    pub fn record_rejected(&self) {
        Self::bump(&self.rejected);
    }

    /// Record a completion.
    pub fn record_completed(&self) {
        Self::bump(&self.completed);
    }

    /// Record an abort.
    pub fn record_aborted(&self) {
        Self::bump(&self.aborted);
    }

    /// Record a stale-holder operation.
    pub fn record_token_mismatch(&self) {
        Self::bump(&self.token_mismatches);
    }

    /// Record a heartbeat renewal.
    pub fn record_renewal(&self) {
        Self::bump(&self.lease_renewals);
    }

    /// Record a capture overflow.
    pub fn record_capture_overflow(&self) {
        Self::bump(&self.capture_overflows);
    }

    /// Record a stream starting.
    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stream ending.
    pub fn stream_closed(&self) {
        let _ = self
            .active_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Get the number of streams in flight.
    pub fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every value.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            passthrough: load(&self.passthrough),
            replay: load(&self.replay),
            conflict: load(&self.conflict),
            execute: load(&self.execute),
            unguarded: load(&self.unguarded),
            rejected: load(&self.rejected),
            completed: load(&self.completed),
            aborted: load(&self.aborted),
            token_mismatches: load(&self.token_mismatches),
            lease_renewals: load(&self.lease_renewals),
            capture_overflows: load(&self.capture_overflows),
            active_streams: load(&self.active_streams),
        }
    }
}

/// Serializable copy of [`CoordinatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub passthrough: u64,
    pub replay: u64,
    pub conflict: u64,
    pub execute: u64,
    pub unguarded: u64,
    pub rejected: u64,
    pub completed: u64,
    pub aborted: u64,
    pub token_mismatches: u64,
    pub lease_renewals: u64,
    pub capture_overflows: u64,
    pub active_streams: u64,
}

impl MetricsSnapshot {
    /// Pairs of metric name and value, for exporters.
    pub fn named(&self) -> Vec<(&'static str, u64)> {
        vec![
            (names::PASSTHROUGH_TOTAL, self.passthrough),
            (names::REPLAY_TOTAL, self.replay),
            (names::CONFLICT_TOTAL, self.conflict),
            (names::EXECUTE_TOTAL, self.execute),
            (names::UNGUARDED_TOTAL, self.unguarded),
            (names::REJECTED_TOTAL, self.rejected),
            (names::COMPLETED_TOTAL, self.completed),
            (names::ABORTED_TOTAL, self.aborted),
            (names::TOKEN_MISMATCH_TOTAL, self.token_mismatches),
            (names::LEASE_RENEWALS_TOTAL, self.lease_renewals),
            (names::CAPTURE_OVERFLOW_TOTAL, self.capture_overflows),
            (names::ACTIVE_STREAMS, self.active_streams),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_streams_never_underflows() {
        let metrics = CoordinatorMetrics::new();
        metrics.stream_opened();
        metrics.stream_closed();
        metrics.stream_closed();
        assert_eq!(metrics.active_streams(), 0);
    }

    #[test]
    fn snapshot_reports_named_values() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_execute();
        metrics.record_execute();
        metrics.record_replay();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.execute, 2);
        assert_eq!(snapshot.replay, 1);
        assert!(snapshot
            .named()
            .contains(&(names::EXECUTE_TOTAL, 2)));
    }
}
