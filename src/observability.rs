use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::workflows::{STATE_CANCELLED, STATE_EXPIRED, STATE_FAILED};

/// Workflow engine counters
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    pub starts: AtomicU64,
    pub transitions: AtomicU64,
    pub conflicts: AtomicU64,
    pub not_found: AtomicU64,
    pub completed: AtomicU64,
    pub expired: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a transition into a terminal state. Custom terminal labels are
    /// folded into `completed`.
    pub fn record_terminal(&self, state: &str) {
        let counter = match state {
            STATE_EXPIRED => &self.expired,
            STATE_FAILED => &self.failed,
            STATE_CANCELLED => &self.cancelled,
            _ => &self.completed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> WorkflowStats {
        WorkflowStats {
            starts: self.starts.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            starts = stats.starts,
            transitions = stats.transitions,
            conflicts = stats.conflicts,
            not_found = stats.not_found,
            completed = stats.completed,
            expired = stats.expired,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Workflow engine metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowStats {
    pub starts: u64,
    pub transitions: u64,
    pub conflicts: u64,
    pub not_found: u64,
    pub completed: u64,
    pub expired: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transitions_land_in_matching_counter() {
        let metrics = WorkflowMetrics::new();
        metrics.record_terminal("EXPIRED");
        metrics.record_terminal("CANCELLED");
        metrics.record_terminal("COMPLETED");
        metrics.record_terminal("REJECTED");

        let stats = metrics.get_stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
    }
}
