//! Engine metrics
//!
//! Metrics are emitted through the `metrics` facade and only exported when
//! a recorder is installed (see [`init_metrics_exporter`]).
//!
//! # Metrics
//!
//! - `changeprop_messages_total{rule, outcome}`: consumed records by outcome
//!   (`matched`, `unmatched`, `parse_error`)
//! - `changeprop_executions_total{rule, status}`: settled executions by status
//! - `changeprop_execution_duration_seconds{rule}`: execution duration
//! - `changeprop_in_flight{rule}`: executions currently in flight
//! - `changeprop_commits_total{rule}`: offsets committed
//! - `changeprop_commit_failures_total{rule}`: failed commits
//!
//! # Examples
//!
//! ```
//! use changeprop::metrics::ExecutionMetrics;
//!
//! let metrics = ExecutionMetrics::new("purge");
//! metrics.record("success");
//! ```

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Metrics for one in-flight execution.
///
/// Increments the in-flight gauge on creation and decrements it exactly
/// once, either in [`ExecutionMetrics::record`] or on drop (so a panicking
/// execution still leaves the gauge accurate).
#[derive(Debug)]
pub struct ExecutionMetrics {
    rule: String,
    start: Instant,
    recorded: AtomicBool,
}

impl ExecutionMetrics {
    /// Starts tracking an execution of `rule`.
    pub fn new(rule: &str) -> Self {
        increment_gauge!("changeprop_in_flight", 1.0, "rule" => rule.to_string());
        Self {
            rule: rule.to_string(),
            start: Instant::now(),
            recorded: AtomicBool::new(false),
        }
    }

    /// Records the final status of the execution.
    ///
    /// # Arguments
    ///
    /// * `status` - One of `success`, `retry`, `error`, `blacklisted`,
    ///   `sampled_out`, `rate_limited`, `duplicate`, `delayed`
    pub fn record(&self, status: &str) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }
        histogram!(
            "changeprop_execution_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "rule" => self.rule.clone()
        );
        increment_counter!(
            "changeprop_executions_total",
            "rule" => self.rule.clone(),
            "status" => status.to_string()
        );
        decrement_gauge!("changeprop_in_flight", 1.0, "rule" => self.rule.clone());
    }

    /// Returns true once a status has been recorded.
    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for ExecutionMetrics {
    fn drop(&mut self) {
        if !self.recorded.load(Ordering::SeqCst) {
            decrement_gauge!("changeprop_in_flight", 1.0, "rule" => self.rule.clone());
        }
    }
}

/// Counts one consumed record.
pub fn record_message(rule: &str, outcome: &'static str) {
    increment_counter!(
        "changeprop_messages_total",
        "rule" => rule.to_string(),
        "outcome" => outcome
    );
}

/// Counts one committed offset.
pub fn record_commit(rule: &str) {
    increment_counter!("changeprop_commits_total", "rule" => rule.to_string());
}

/// Counts one failed commit.
pub fn record_commit_failure(rule: &str) {
    increment_counter!("changeprop_commit_failures_total", "rule" => rule.to_string());
}

/// Initializes the metrics exporter for Prometheus
///
/// With the `prometheus` feature this installs the Prometheus exporter on
/// its default listen address; otherwise it does nothing.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let _ = builder.install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_once() {
        let metrics = ExecutionMetrics::new("rule");
        assert!(!metrics.is_recorded());
        metrics.record("success");
        assert!(metrics.is_recorded());
        metrics.record("error");
        assert!(metrics.is_recorded());
    }

    #[test]
    fn test_drop_without_recording() {
        let metrics = ExecutionMetrics::new("rule");
        drop(metrics);
    }

    #[test]
    fn test_free_functions_do_not_panic() {
        record_message("rule", "matched");
        record_commit("rule");
        record_commit_failure("rule");
        init_metrics_exporter();
    }

    #[test]
    fn test_is_send() {
        fn assert_send<T: Send + Sync>() {}
        assert_send::<ExecutionMetrics>();
    }
}
