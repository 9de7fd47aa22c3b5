//! Per-test databases inside a shared container.
//!
//! [`Container::dsn`] gives every test its own database in a service container
//! started once for many tests. Creation is serialized per provider and
//! retried; teardown is registered with the calling test's scope.

use crate::container::Container;
use crate::scope::{Scope, ScopeExt};
use async_trait::async_trait;
use observability::{dsn_span, TestbedMetrics};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use testbed_shared_types::{Result, TestbedError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

/// Creation attempts before giving up.
pub const MAX_DSN_ATTEMPTS: u32 = 10;

/// Backoff unit; attempt `n` is followed by a sleep of `n` units.
pub const DSN_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Longest database name accepted by the supported engines.
pub const MAX_DATABASE_NAME_LEN: usize = 63;

const HASH_SUFFIX_LEN: usize = 8;

/// Result of a single creation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    /// Worth retrying; carries what the engine said.
    Transient(String),
}

/// A database engine able to host isolated per-test databases.
#[async_trait]
pub trait DsnProvider: Send + Sync {
    /// Engine name used in logs and metrics.
    fn engine(&self) -> &str;

    /// Held while creating a database; one per provider.
    fn creation_lock(&self) -> &Mutex<()>;

    /// Make one attempt at creating `database`.
    ///
    /// `Err` is for transport failures; whether the container is still alive
    /// is checked separately, so providers need not interpret output for that.
    async fn create_database(&self, container: &Container, database: &str) -> Result<CreateOutcome>;

    async fn drop_database(&self, container: &Container, database: &str) -> Result<()>;

    async fn format_dsn(&self, container: &Container, database: &str) -> Result<String>;
}

/// Database name for a hierarchical test name.
///
/// The result is a lowercase SQL identifier of at most 63 characters. Whenever
/// sanitizing changes the name, a hash of the original is appended so that two
/// distinct test names never map to the same database.
pub fn database_name(test_name: &str) -> String {
    let mut name: String = test_name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        name = "testdb".to_string();
    } else if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }

    if name == test_name && name.len() <= MAX_DATABASE_NAME_LEN {
        return name;
    }
    let digest = hex::encode(Sha256::digest(test_name.as_bytes()));
    name.truncate(MAX_DATABASE_NAME_LEN - HASH_SUFFIX_LEN - 1);
    format!("{}_{}", name, &digest[..HASH_SUFFIX_LEN])
}

/// Create (or reuse) the database for `scope` and return its DSN.
pub(crate) async fn provision(
    container: &Container,
    provider: Arc<dyn DsnProvider>,
    scope: &dyn Scope,
) -> Result<String> {
    let database = database_name(scope.name());
    if let Some(dsn) = container.cached_dsn(&database).await {
        return Ok(dsn);
    }

    let span = dsn_span!(scope.name(), &database);
    provision_locked(container, provider, scope, database)
        .instrument(span)
        .await
}

async fn provision_locked(
    container: &Container,
    provider: Arc<dyn DsnProvider>,
    scope: &dyn Scope,
    database: String,
) -> Result<String> {
    let _guard = provider.creation_lock().lock().await;
    // Another caller may have finished while we waited for the lock.
    if let Some(dsn) = container.cached_dsn(&database).await {
        return Ok(dsn);
    }

    create_with_retries(container, provider.as_ref(), scope.name(), &database).await?;
    // The database exists from here on, so its drop is owed even if no DSN
    // can be produced for it.
    if container.track_database(&database).await {
        TestbedMetrics::new().inc_databases_created(provider.engine());
        info!(engine = provider.engine(), "Created test database");
        register_drop(container, provider.clone(), scope, database.clone());
    }

    let dsn = provider.format_dsn(container, &database).await?;
    container.cache_dsn(&database, &dsn).await;
    Ok(dsn)
}

async fn create_with_retries(
    container: &Container,
    provider: &dyn DsnProvider,
    test: &str,
    database: &str,
) -> Result<()> {
    let metrics = TestbedMetrics::new();
    let mut last_error = String::new();

    for attempt in 1..=MAX_DSN_ATTEMPTS {
        ensure_running(container).await?;
        metrics.inc_dsn_attempts(provider.engine());

        match provider.create_database(container, database).await {
            Ok(CreateOutcome::Created) => return Ok(()),
            Ok(CreateOutcome::AlreadyExists) => {
                debug!(database, "Database already exists");
                return Ok(());
            }
            Ok(CreateOutcome::Transient(reason)) => last_error = reason,
            Err(e) if e.is_container_gone() => return Err(e),
            Err(e) => last_error = e.to_string(),
        }
        debug!(database, attempt, error = %last_error, "Database creation attempt failed");

        ensure_running(container).await?;
        if attempt < MAX_DSN_ATTEMPTS {
            tokio::time::sleep(DSN_RETRY_BACKOFF * attempt).await;
        }
    }

    Err(TestbedError::DsnCreation {
        test: test.to_string(),
        attempts: MAX_DSN_ATTEMPTS,
        last_error,
    })
}

async fn ensure_running(container: &Container) -> Result<()> {
    let info = container.inspect().await?;
    if info.is_running() {
        Ok(())
    } else {
        Err(TestbedError::NotRunning(container.id().clone()))
    }
}

fn register_drop(
    container: &Container,
    provider: Arc<dyn DsnProvider>,
    scope: &dyn Scope,
    database: String,
) {
    let container = container.clone();
    scope.defer(move |exit| async move {
        if exit.failed && container.keeps_failed() {
            info!(database = %database, "Keeping database of failed test");
            return;
        }
        match provider.drop_database(&container, &database).await {
            Ok(()) => debug!(database = %database, "Dropped test database"),
            Err(e) if e.is_container_gone() => {
                debug!(database = %database, "Container already gone, nothing to drop")
            }
            Err(e) => {
                warn!(database = %database, error = %e, "Failed to drop test database");
                TestbedMetrics::new().inc_cleanup_failures("database");
            }
        }
        container.forget_dsn(&database).await;
    });
}
