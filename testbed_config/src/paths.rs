//! XDG-compliant settings location.

use std::path::{Path, PathBuf};

use crate::{error::Result, ConfigError, APP_NAME};

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "TESTBED_CONFIG";

/// Where the settings file lives.
///
/// Default location: `~/.config/testbed/settings.toml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    config_dir: PathBuf,
}

impl ConfigPaths {
    /// Create paths using XDG defaults.
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::PathError("Could not determine config directory".into()))?
            .join(APP_NAME);
        Ok(Self { config_dir })
    }

    /// Create paths with a custom base directory (for testing).
    pub fn with_base(base: impl AsRef<Path>) -> Self {
        Self {
            config_dir: base.as_ref().join("config"),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.toml")
    }
}

/// The settings file to read: `$TESTBED_CONFIG` when set, otherwise the XDG
/// default. `None` when neither can be determined.
pub fn resolve_settings_file(env_value: Option<String>) -> Option<PathBuf> {
    match env_value.filter(|v| !v.trim().is_empty()) {
        Some(explicit) => Some(PathBuf::from(explicit)),
        None => ConfigPaths::new().ok().map(|p| p.settings_file()),
    }
}
