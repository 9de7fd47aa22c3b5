//! Tracing configuration and initialization.
//!
//! Test binaries usually call [`try_init_tracing`] from every test, since only
//! the first subscriber installed in a process takes effect.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for tracing initialization.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Name reported in the startup event
    pub service_name: String,
    /// Log level used when `RUST_LOG` is unset
    pub log_level: Level,
    /// Whether to include span events (enter, exit, close)
    pub include_span_events: bool,
    /// Whether to output in JSON format
    pub json_output: bool,
    /// Whether to include file and line numbers
    pub include_location: bool,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Route output through the test harness capture instead of raw stderr
    pub test_writer: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "testbed".to_string(),
            log_level: Level::INFO,
            include_span_events: false,
            json_output: false,
            include_location: false,
            include_target: true,
            test_writer: false,
        }
    }
}

impl TracingConfig {
    /// Create a new config with the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Enable JSON output format.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json_output = json;
        self
    }

    /// Include span events in output.
    pub fn with_span_events(mut self, include: bool) -> Self {
        self.include_span_events = include;
        self
    }

    /// Write through libtest's capture so output shows up only for failing tests.
    pub fn for_tests(mut self) -> Self {
        self.test_writer = true;
        self
    }

    /// Build an EnvFilter from this config.
    fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{}", self.log_level)))
    }
}

/// Initialize tracing with the given configuration.
///
/// Returns `false` when a global subscriber was already installed.
///
/// # Example
///
/// ```no_run
/// use observability::{try_init_tracing, TracingConfig};
/// use tracing::Level;
///
/// try_init_tracing(TracingConfig::new("my-tests").with_level(Level::DEBUG).for_tests());
/// ```
pub fn try_init_tracing(config: TracingConfig) -> bool {
    let filter = config.build_filter();

    let span_events = if config.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let installed = if config.json_output {
        // JSON format for log aggregation in CI
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(config.include_target);

        if config.test_writer {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_test_writer())
                .try_init()
                .is_ok()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .is_ok()
        }
    } else {
        // Human-readable format for local runs
        let fmt_layer = fmt::layer()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_target(config.include_target);

        if config.test_writer {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_test_writer())
                .try_init()
                .is_ok()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .is_ok()
        }
    };

    if installed {
        tracing::debug!(
            service = %config.service_name,
            level = %config.log_level,
            "Tracing initialized"
        );
    }
    installed
}

/// Initialize tracing, ignoring an already installed subscriber.
pub fn init_tracing(config: TracingConfig) {
    try_init_tracing(config);
}

/// Create a span for container operations.
#[macro_export]
macro_rules! container_span {
    ($op:expr, $container_id:expr) => {
        tracing::info_span!(
            "container_operation",
            operation = $op,
            container_id = %$container_id
        )
    };
    ($op:expr, $container_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "container_operation",
            operation = $op,
            container_id = %$container_id,
            $($field)*
        )
    };
}

/// Create a span for per-test database provisioning.
#[macro_export]
macro_rules! dsn_span {
    ($test:expr, $database:expr) => {
        tracing::info_span!(
            "dsn_operation",
            test = %$test,
            database = %$database
        )
    };
}
