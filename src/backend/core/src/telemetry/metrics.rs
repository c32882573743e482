//! Metric names and recording helpers.
//!
//! ```rust,ignore
//! use restraint_core::telemetry::metrics::{record_reconcile, ReconcileOutcome};
//!
//! record_reconcile(ReconcileOutcome::Committed, 0.012);
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Errors constructed, labelled by code/category/retryable.
pub const ERRORS_TOTAL: &str = "restraint_errors_total";
/// Reconciliation runs, labelled by outcome.
pub const RECONCILE_TOTAL: &str = "restraint_reconcile_total";
/// Reconciliation wall time in seconds.
pub const RECONCILE_DURATION: &str = "restraint_reconcile_duration_seconds";
/// Permission maps loaded from the store.
pub const RESOLVE_TOTAL: &str = "restraint_resolve_total";
/// Result filter decisions, labelled by decision.
pub const FILTER_DECISIONS_TOTAL: &str = "restraint_filter_decisions_total";

/// How a reconciliation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Committed,
    RolledBack,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Register descriptions for every metric emitted by this crate.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(ERRORS_TOTAL, "Total number of restraint errors");
    describe_counter!(RECONCILE_TOTAL, "Total number of reconciliation runs");
    describe_histogram!(RECONCILE_DURATION, "Reconciliation duration in seconds");
    describe_counter!(RESOLVE_TOTAL, "Total number of permission map loads");
    describe_counter!(FILTER_DECISIONS_TOTAL, "Total number of result filter decisions");
}

pub fn record_reconcile(outcome: ReconcileOutcome, seconds: f64) {
    counter!(RECONCILE_TOTAL, "outcome" => outcome.as_str()).increment(1);
    histogram!(RECONCILE_DURATION, "outcome" => outcome.as_str()).record(seconds);
}

pub fn record_resolve() {
    counter!(RESOLVE_TOTAL).increment(1);
}

pub fn record_filter_decision(decision: &'static str) {
    counter!(FILTER_DECISIONS_TOTAL, "decision" => decision).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ReconcileOutcome::Committed.as_str(), "committed");
        assert_eq!(ReconcileOutcome::RolledBack.as_str(), "rolled_back");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_reconcile(ReconcileOutcome::Committed, 0.5);
        record_resolve();
        record_filter_decision("allow_all");
    }
}
