//! Operation metrics
//!
//! Every storage operation reports one observation keyed by
//! (operation, cache type, outcome). The recorder is pluggable; [`NoopMetrics`]
//! is the default and [`PrometheusMetrics`] feeds process-wide Prometheus
//! collectors.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::fmt;

/// Storage operations that emit observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnsureTable,
    Get,
    GetAll,
    FilterIdentifiers,
    ListIdentifiers,
    Upsert,
    Delete,
    Relationships,
    Evict,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::EnsureTable => "ensure_table",
            Operation::Get => "get",
            Operation::GetAll => "get_all",
            Operation::FilterIdentifiers => "filter_identifiers",
            Operation::ListIdentifiers => "list_identifiers",
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
            Operation::Relationships => "relationships",
            Operation::Evict => "evict",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Succeeded on the first attempt
    Success,
    /// Succeeded after at least one retry
    Retried,
    /// Gave up
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retried => "retried",
            Outcome::Failed => "failed",
        }
    }

    /// Outcome of a successful run that took `attempts` attempts
    pub fn from_attempts(attempts: u32) -> Self {
        if attempts > 1 {
            Outcome::Retried
        } else {
            Outcome::Success
        }
    }
}

/// Sink for operation observations
///
/// Implementations must not panic and must not block.
pub trait MetricsRecorder: Send + Sync {
    fn observe(&self, operation: Operation, cache_type: &str, outcome: Outcome, duration_nanos: u64);
}

/// Discards every observation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn observe(&self, _: Operation, _: &str, _: Outcome, _: u64) {}
}

lazy_static! {
    /// Counter: storage operations by type and outcome
    pub static ref OPERATIONS: CounterVec = register_counter_vec!(
        "cachegraph_operations_total",
        "Storage operations by operation, cache type and outcome",
        &["operation", "cache_type", "outcome"]
    )
    .expect("Failed to create operations metric");

    /// Histogram: storage operation duration (seconds)
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "cachegraph_operation_duration_seconds",
        "Duration of storage operations",
        &["operation", "cache_type"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("Failed to create operation_duration metric");
}

/// Records observations into the process-wide Prometheus registry
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsRecorder for PrometheusMetrics {
    fn observe(&self, operation: Operation, cache_type: &str, outcome: Outcome, duration_nanos: u64) {
        // Label lookups return errors instead of panicking; a lost sample is fine.
        if let Ok(counter) =
            OPERATIONS.get_metric_with_label_values(&[operation.as_str(), cache_type, outcome.as_str()])
        {
            counter.inc();
        }
        if let Ok(histogram) =
            OPERATION_DURATION.get_metric_with_label_values(&[operation.as_str(), cache_type])
        {
            histogram.observe(duration_nanos as f64 / 1e9);
        }
    }
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_attempts() {
        assert_eq!(Outcome::from_attempts(1), Outcome::Success);
        assert_eq!(Outcome::from_attempts(3), Outcome::Retried);
    }

    #[test]
    fn test_noop_never_panics() {
        NoopMetrics.observe(Operation::Get, "vpcs", Outcome::Failed, u64::MAX);
    }

    #[test]
    fn test_prometheus_metrics_exported() {
        PrometheusMetrics.observe(Operation::Upsert, "subnets", Outcome::Success, 1_500_000);
        PrometheusMetrics.observe(Operation::Upsert, "subnets", Outcome::Retried, 2_000_000);

        let output = encode_metrics();
        assert!(output.contains("cachegraph_operations_total"));
        assert!(output.contains("cachegraph_operation_duration_seconds"));
        assert!(output.contains("cache_type=\"subnets\""));
    }
}
