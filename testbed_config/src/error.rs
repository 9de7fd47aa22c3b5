//! Error types for the testbed_config crate.

use thiserror::Error;

use testbed_shared_types::TestbedError;

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while resolving settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading the settings file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing TOML configuration.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Error serializing to TOML.
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A value from the file or the environment is out of range or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration path error.
    #[error("Path error: {0}")]
    PathError(String),
}

impl ConfigError {
    /// Create a new validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Validation error naming the offending variable and value.
    pub fn invalid_env(var: &str, value: &str, expected: &str) -> Self {
        Self::Validation(format!("{var}={value:?}: expected {expected}"))
    }
}

impl From<ConfigError> for TestbedError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => TestbedError::Io(e),
            other => TestbedError::Config(other.to_string()),
        }
    }
}
