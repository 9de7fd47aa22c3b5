//! Command implementations and the context they share.

pub mod endpoint;
pub mod exec;
pub mod port;
pub mod ps;
pub mod start;
pub mod stop;
pub mod sweep;
pub mod wait;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use testbed_core::{Backend, Harness, Settings};

use crate::error::Result;
use crate::state::{ContainerRecord, StateFile};
use crate::OutputFormat;

/// Everything a command needs besides its own arguments.
pub struct Context {
    pub state_path: PathBuf,
    pub settings: Settings,
    pub format: OutputFormat,
}

impl Context {
    pub fn load_state(&self) -> Result<StateFile> {
        StateFile::load(&self.state_path)
    }

    pub fn save_state(&self, state: &StateFile) -> Result<()> {
        state.save(&self.state_path)
    }

    pub async fn harness(&self) -> Result<Harness> {
        Ok(Harness::from_settings(self.settings.clone()).await?)
    }

    /// The backend a recorded container was created with.
    pub async fn backend_for(&self, record: &ContainerRecord) -> Result<Arc<dyn Backend>> {
        let harness = self.harness().await?;
        Ok(harness.registry().get(&record.backend)?)
    }
}

/// Parse `KEY=VAL`. The value may itself contain `=`.
pub fn parse_env(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VAL, got {value:?}")),
    }
}

/// Parse `30s`, `500ms`, `2m` or a bare number of seconds.
pub fn parse_timeout(value: &str) -> std::result::Result<Duration, String> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    testbed_config::parse_duration(value).ok_or_else(|| format!("invalid duration {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("A=1").unwrap(), ("A".to_string(), "1".to_string()));
        assert_eq!(
            parse_env("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_timeout("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_timeout("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_timeout("soon").is_err());
    }
}
