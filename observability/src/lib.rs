//! Observability for the testbed harness.
//!
//! - **Tracing**: structured logging with container and database spans
//! - **Metrics**: counters and histograms through the `metrics` facade
//!
//! No metrics exporter is installed here. Test binaries that want the numbers
//! install any `metrics` recorder before creating containers.

pub mod metrics;
pub mod tracing_setup;

pub use self::metrics::{describe_metrics, MetricTimer, TestbedMetrics};
pub use tracing_setup::{init_tracing, try_init_tracing, TracingConfig};

/// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level};
