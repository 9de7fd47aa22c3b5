//! Name to container records kept between CLI invocations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CliError, Result};

/// File name used under the cache directory when no state path is given.
pub const STATE_FILE_NAME: &str = "state.json";

/// One container started by `testbed start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub backend: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub ports: Vec<String>,
    /// Log line `wait` looks for when the container was started with `--async`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_log: Option<String>,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    containers: BTreeMap<String, ContainerRecord>,
}

impl StateFile {
    /// Read the state at `path`. A missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No state file at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).map_err(|e| CliError::state(path, e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so a crash never leaves half a file behind.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ContainerRecord> {
        self.containers
            .get(name)
            .ok_or_else(|| CliError::UnknownContainer(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ContainerRecord> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| CliError::UnknownContainer(name.to_string()))
    }

    /// Record a new container. Names are unique within one state file.
    pub fn insert(&mut self, name: &str, record: ContainerRecord) -> Result<()> {
        if self.containers.contains_key(name) {
            return Err(CliError::AlreadyExists(name.to_string()));
        }
        self.containers.insert(name.to_string(), record);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<ContainerRecord> {
        self.containers
            .remove(name)
            .ok_or_else(|| CliError::UnknownContainer(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContainerRecord)> {
        self.containers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// Default state location: `<cache_dir>/testbed/state.json`.
pub fn default_state_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(testbed_config::APP_NAME)
        .join(STATE_FILE_NAME)
}
