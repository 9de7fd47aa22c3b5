//! CLI error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("No container named {0:?}")]
    UnknownContainer(String),

    #[error("Container {0:?} already exists")]
    AlreadyExists(String),

    #[error("State file {path}: {reason}")]
    State { path: String, reason: String },

    #[error(transparent)]
    Testbed(#[from] testbed_shared_types::TestbedError),

    #[error("Configuration error: {0}")]
    Config(#[from] testbed_config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn state(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::State {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;
