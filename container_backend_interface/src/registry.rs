use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::{Backend, Result, TestbedError};

/// Name → backend map consulted once per container creation.
///
/// Filled during harness setup and only read afterwards.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    default: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `backend` under `name`. The first registration becomes the default.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TestbedError::Config("backend name must not be empty".to_string()));
        }
        if self.backends.contains_key(&name) {
            return Err(TestbedError::Config(format!(
                "backend {name:?} is already registered"
            )));
        }
        info!("Registered container backend {:?} ({})", name, backend.name());
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| TestbedError::BackendNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(TestbedError::BackendNotRegistered(name.to_string()));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Looks up `name`, or the default backend when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<(String, Arc<dyn Backend>)> {
        let name = match name.or(self.default.as_deref()) {
            Some(n) => n.to_string(),
            None => return Err(TestbedError::BackendNotRegistered("<default>".to_string())),
        };
        let backend = self.get(&name)?;
        Ok((name, backend))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
