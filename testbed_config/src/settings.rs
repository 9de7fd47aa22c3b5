//! Process-wide harness settings.
//!
//! Resolution order: built-in defaults, then the TOML settings file, then
//! `TESTBED_*` environment variables. A malformed value at any layer is an
//! error rather than a silent fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::paths::{resolve_settings_file, CONFIG_ENV};

pub const ENV_VERBOSE: &str = "TESTBED_VERBOSE";
pub const ENV_KEEP_FAILED: &str = "TESTBED_KEEP_FAILED";
pub const ENV_BACKEND: &str = "TESTBED_BACKEND";
pub const ENV_RUNTIME: &str = "TESTBED_RUNTIME";
pub const ENV_MAX_CONCURRENT: &str = "TESTBED_MAX_CONCURRENT";
pub const ENV_CREATE_DELAY: &str = "TESTBED_CREATE_DELAY";
pub const ENV_EXEC_TIMEOUT: &str = "TESTBED_EXEC_TIMEOUT";
pub const ENV_WAIT_TIMEOUT: &str = "TESTBED_WAIT_TIMEOUT";
pub const ENV_LABEL: &str = "TESTBED_LABEL";
pub const ENV_WARN_OLD: &str = "TESTBED_WARN_OLD";
pub const ENV_CLEANUP_OLD: &str = "TESTBED_CLEANUP_OLD";
pub const ENV_CLEANUP_AGE: &str = "TESTBED_CLEANUP_AGE";

/// Harness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Surface kept container log lines in test output.
    pub verbose: bool,
    /// Leave containers of failed tests in place for inspection.
    pub keep_failed: bool,
    /// Registry name of the backend used when a container does not pick one.
    pub backend: String,
    /// Runtime binary for the CLI backend. Discovered when unset.
    pub runtime_binary: Option<PathBuf>,
    /// Upper bound on container creations in flight at once.
    pub max_concurrent_starts: usize,
    /// Settle delay applied by startup gates after admission.
    #[serde(with = "duration_str")]
    pub create_delay: Duration,
    #[serde(with = "duration_str")]
    pub exec_timeout: Duration,
    /// Budget for wait conditions that do not carry their own.
    #[serde(with = "duration_str")]
    pub default_wait_timeout: Duration,
    /// Namespace for the labels put on every created container.
    pub label_prefix: String,
    /// Log labelled containers older than `cleanup_age` at harness startup.
    pub warn_old: bool,
    /// Remove labelled containers older than `cleanup_age` at harness startup.
    pub cleanup_old: bool,
    #[serde(with = "duration_str")]
    pub cleanup_age: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbose: false,
            keep_failed: false,
            backend: "docker".to_string(),
            runtime_binary: None,
            max_concurrent_starts: 20,
            create_delay: Duration::from_millis(200),
            exec_timeout: Duration::from_secs(60),
            default_wait_timeout: Duration::from_secs(30),
            label_prefix: "testbed".to_string(),
            warn_old: true,
            cleanup_old: false,
            cleanup_age: Duration::from_secs(5 * 60),
        }
    }
}

impl Settings {
    /// Defaults, overlaid with the settings file and the process environment.
    pub fn load() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let file = resolve_settings_file(lookup(CONFIG_ENV));
        let mut settings = match file {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        settings.apply_env(lookup)?;
        Ok(settings)
    }

    /// Read a TOML settings file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_VERBOSE) {
            self.verbose = parse_bool(ENV_VERBOSE, &v)?;
        }
        if let Some(v) = lookup(ENV_KEEP_FAILED) {
            self.keep_failed = parse_bool(ENV_KEEP_FAILED, &v)?;
        }
        if let Some(v) = lookup(ENV_BACKEND) {
            self.backend = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_RUNTIME) {
            let v = v.trim();
            self.runtime_binary = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup(ENV_MAX_CONCURRENT) {
            self.max_concurrent_starts = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_env(ENV_MAX_CONCURRENT, &v, "a positive integer"))?;
        }
        if let Some(v) = lookup(ENV_CREATE_DELAY) {
            self.create_delay = parse_duration(&v)
                .ok_or_else(|| ConfigError::invalid_env(ENV_CREATE_DELAY, &v, "a duration"))?;
        }
        if let Some(v) = lookup(ENV_EXEC_TIMEOUT) {
            self.exec_timeout = parse_duration(&v)
                .ok_or_else(|| ConfigError::invalid_env(ENV_EXEC_TIMEOUT, &v, "a duration"))?;
        }
        if let Some(v) = lookup(ENV_WAIT_TIMEOUT) {
            self.default_wait_timeout = parse_duration(&v)
                .ok_or_else(|| ConfigError::invalid_env(ENV_WAIT_TIMEOUT, &v, "a duration"))?;
        }
        if let Some(v) = lookup(ENV_LABEL) {
            self.label_prefix = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_WARN_OLD) {
            self.warn_old = parse_bool(ENV_WARN_OLD, &v)?;
        }
        if let Some(v) = lookup(ENV_CLEANUP_OLD) {
            self.cleanup_old = parse_bool(ENV_CLEANUP_OLD, &v)?;
        }
        if let Some(v) = lookup(ENV_CLEANUP_AGE) {
            self.cleanup_age = parse_duration(&v)
                .ok_or_else(|| ConfigError::invalid_env(ENV_CLEANUP_AGE, &v, "a duration"))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() {
            return Err(ConfigError::validation("backend must not be empty"));
        }
        if self.max_concurrent_starts == 0 {
            return Err(ConfigError::validation("max_concurrent_starts must be at least 1"));
        }
        if self.exec_timeout.is_zero() {
            return Err(ConfigError::validation("exec_timeout must be positive"));
        }
        if self.default_wait_timeout.is_zero() {
            return Err(ConfigError::validation("default_wait_timeout must be positive"));
        }
        if self.cleanup_age.is_zero() {
            return Err(ConfigError::validation("cleanup_age must be positive"));
        }
        if self.label_prefix.is_empty()
            || !self
                .label_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(ConfigError::validation(format!(
                "label_prefix {:?} is not a valid label key",
                self.label_prefix
            )));
        }
        Ok(())
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid_env(var, value, "a boolean")),
    }
}

/// Parse `"250ms"`, `"2s"`, `"1.5s"`, `"3m"` or a bare number of milliseconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let nanos_per_unit = match unit.trim() {
        "" | "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        _ => return None,
    };
    Some(Duration::from_nanos((number * nanos_per_unit).round() as u64))
}

/// Render a duration the way [`parse_duration`] reads it back.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {raw:?}")))
    }
}
