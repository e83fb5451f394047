//! Metric names and descriptions.
//!
//! Recording goes through the `metrics` facade; whichever recorder the
//! embedding process installs receives the values. Without one, recording
//! is a no-op.

use metrics::{describe_counter, describe_histogram, Unit};

/// Deliveries handled, labelled by `kind` and `outcome`.
pub const EVENTS_TOTAL: &str = "tally_events_total";

/// Duration of conditional commits, labelled by `backend`.
pub const COMMIT_SECONDS: &str = "tally_commit_seconds";

/// Errors constructed, labelled by `code`, `category` and `retryable`.
pub const ERRORS_TOTAL: &str = "tally_errors_total";

/// Register descriptions for every metric with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        EVENTS_TOTAL,
        Unit::Count,
        "Deliveries handled by consumer workers, by event kind and outcome"
    );
    describe_histogram!(
        COMMIT_SECONDS,
        Unit::Seconds,
        "Duration of conditional projection commits"
    );
    describe_counter!(ERRORS_TOTAL, Unit::Count, "Errors raised, by error code");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_without_recorder_is_noop() {
        describe_metrics();
        metrics::counter!(EVENTS_TOTAL, "kind" => "issue_created", "outcome" => "applied")
            .increment(1);
    }

    #[test]
    fn test_metric_names_share_prefix() {
        for name in [EVENTS_TOTAL, COMMIT_SECONDS, ERRORS_TOTAL] {
            assert!(name.starts_with("tally_"));
        }
    }
}
