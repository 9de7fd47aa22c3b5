//! Startup gates for engines that misbehave when many instances boot at once.

use std::sync::Arc;
use std::time::Duration;
use testbed_shared_types::{Result, TestbedError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounds how many containers of one engine are being created at a time.
///
/// Owned by whoever registers it (usually an engine preset) and shared by
/// cloning; clones admit against the same permits.
#[derive(Debug, Clone)]
pub struct StartupGate {
    name: String,
    permits: Arc<Semaphore>,
    capacity: usize,
    settle_delay: Duration,
}

/// Held while a container is created and started.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl StartupGate {
    pub fn new(name: impl Into<String>, capacity: usize, settle_delay: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            settle_delay,
        }
    }

    /// One creation at a time.
    pub fn serial(name: impl Into<String>, settle_delay: Duration) -> Self {
        Self::new(name, 1, settle_delay)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a permit, then sleep the settle delay before returning it.
    pub async fn admit(&self) -> Result<GatePermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TestbedError::backend(format!("startup gate {} closed", self.name)))?;
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        debug!(gate = %self.name, "Admitted through startup gate");
        Ok(GatePermit { _permit: permit })
    }
}
