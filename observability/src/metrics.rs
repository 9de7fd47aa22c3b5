//! Harness metrics.
//!
//! Recorded through the `metrics` facade. Without an installed recorder every
//! call is a no-op.

use ::metrics::{counter, describe_counter, describe_histogram, histogram, Label};

pub const CONTAINERS_CREATED: &str = "testbed_containers_created_total";
pub const CONTAINER_ERRORS: &str = "testbed_container_errors_total";
pub const WAIT_DURATION: &str = "testbed_wait_duration_seconds";
pub const DATABASES_CREATED: &str = "testbed_databases_created_total";
pub const DSN_ATTEMPTS: &str = "testbed_dsn_attempts_total";
pub const CLEANUP_FAILURES: &str = "testbed_cleanup_failures_total";

/// Register descriptions for every harness metric.
pub fn describe_metrics() {
    describe_counter!(CONTAINERS_CREATED, "Containers created and ready");
    describe_counter!(
        CONTAINER_ERRORS,
        "Container operations that failed, by operation"
    );
    describe_histogram!(WAIT_DURATION, "Time spent waiting for containers to become ready");
    describe_counter!(DATABASES_CREATED, "Per-test databases created");
    describe_counter!(DSN_ATTEMPTS, "Database creation attempts, including retries");
    describe_counter!(CLEANUP_FAILURES, "Cleanup actions that failed and were logged");
}

/// Recording helpers used by the harness.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestbedMetrics;

impl TestbedMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn inc_containers_created(&self, backend: &str, image: &str) {
        let labels = [("backend", backend.to_string()), ("image", image.to_string())];
        counter!(CONTAINERS_CREATED, &labels).increment(1);
    }

    pub fn inc_container_errors(&self, backend: &str, operation: &'static str) {
        let labels = [("backend", backend.to_string()), ("operation", operation.to_string())];
        counter!(CONTAINER_ERRORS, &labels).increment(1);
    }

    /// Times a readiness wait; the duration is recorded when the guard drops.
    pub fn wait_timer(&self, condition: &'static str) -> MetricTimer {
        MetricTimer::new(WAIT_DURATION).with_label("condition", condition)
    }

    pub fn inc_databases_created(&self, engine: &str) {
        let labels = [("engine", engine.to_string())];
        counter!(DATABASES_CREATED, &labels).increment(1);
    }

    pub fn inc_dsn_attempts(&self, engine: &str) {
        let labels = [("engine", engine.to_string())];
        counter!(DSN_ATTEMPTS, &labels).increment(1);
    }

    pub fn inc_cleanup_failures(&self, kind: &'static str) {
        let labels = [("kind", kind.to_string())];
        counter!(CLEANUP_FAILURES, &labels).increment(1);
    }
}

/// Timer guard recording its lifetime into a histogram on drop.
pub struct MetricTimer {
    start: std::time::Instant,
    histogram_name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl MetricTimer {
    /// Create a new timer for the given histogram.
    pub fn new(histogram_name: &'static str) -> Self {
        Self {
            start: std::time::Instant::now(),
            histogram_name,
            labels: vec![],
        }
    }

    /// Add a label to the timer.
    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels: Vec<Label> = self
            .labels
            .iter()
            .map(|(k, v)| Label::new(*k, v.clone()))
            .collect();

        histogram!(self.histogram_name, labels).record(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        let metrics = TestbedMetrics::new();
        metrics.inc_containers_created("mock", "redis:7");
        metrics.inc_container_errors("mock", "create");
        drop(metrics.wait_timer("log"));
        metrics.inc_databases_created("postgres");
        metrics.inc_dsn_attempts("postgres");
        metrics.inc_cleanup_failures("database");
    }

    #[test]
    fn test_timer_guard() {
        let timer = TestbedMetrics::new().wait_timer("exec");
        assert_eq!(timer.histogram_name, WAIT_DURATION);
        assert_eq!(timer.labels, vec![("condition", "exec".to_string())]);
        drop(timer);
    }
}
