// Outcome counters for the two-phase subsystem.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotone counters; cheap to bump from any pipeline.
#[derive(Debug, Default)]
pub struct TwoPhaseStats {
    prepared: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    recovered: AtomicU64,
}

/// Snapshot of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoPhaseStatsSummary {
    pub prepared: u64,
    pub committed_prepared: u64,
    pub aborted_prepared: u64,
    pub recovered: u64,
}

impl TwoPhaseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_prepare(&self) {
        self.prepared.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts the prepared transaction as committed or aborted.
    pub fn record_finish(&self, is_commit: bool) {
        if is_commit {
            self.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_recovered(&self, count: u64) {
        self.recovered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn summary(&self) -> TwoPhaseStatsSummary {
        TwoPhaseStatsSummary {
            prepared: self.prepared.load(Ordering::Relaxed),
            committed_prepared: self.committed.load(Ordering::Relaxed),
            aborted_prepared: self.aborted.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.prepared.store(0, Ordering::Relaxed);
        self.committed.store(0, Ordering::Relaxed);
        self.aborted.store(0, Ordering::Relaxed);
        self.recovered.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = TwoPhaseStats::new();
        stats.record_prepare();
        stats.record_finish(true);
        stats.record_finish(false);
        stats.record_recovered(2);

        let summary = stats.summary();
        assert_eq!(summary.prepared, 1);
        assert_eq!(summary.committed_prepared, 1);
        assert_eq!(summary.aborted_prepared, 1);
        assert_eq!(summary.recovered, 2);

        stats.reset();
        assert_eq!(stats.summary(), TwoPhaseStatsSummary::default());
    }
}
