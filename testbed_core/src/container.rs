//! The handle returned for a created, ready container.

use crate::dsn;
use crate::logs::{LogFilter, LogStreamer};
use crate::options::Config;
use crate::scope::{LogSink, Scope};
use container_backend_interface::Backend;
use observability::{container_span, TestbedMetrics};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::path::Path;
use testbed_shared_types::{
    normalize_port, ContainerId, ContainerInfo, ExecOutput, FileCopy, Result, TestbedError,
    LOCALHOST,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

struct ContainerInner {
    id: ContainerId,
    test_name: String,
    backend_name: String,
    backend: Arc<dyn Backend>,
    config: Config,
    exec_timeout: Duration,
    keep_failed: bool,
    removed: AtomicBool,
    databases: Mutex<HashMap<String, String>>,
    /// Databases with a drop registered, whether or not a DSN was produced.
    tracked: Mutex<HashSet<String>>,
    streamer: std::sync::Mutex<Option<LogStreamer>>,
}

/// A live container. Clones refer to the same container and may be used
/// concurrently from many tests.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

pub(crate) struct ContainerParts {
    pub id: ContainerId,
    pub test_name: String,
    pub backend_name: String,
    pub backend: Arc<dyn Backend>,
    pub config: Config,
    pub exec_timeout: Duration,
    pub keep_failed: bool,
}

impl Container {
    pub(crate) fn new(parts: ContainerParts) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id: parts.id,
                test_name: parts.test_name,
                backend_name: parts.backend_name,
                backend: parts.backend,
                config: parts.config,
                exec_timeout: parts.exec_timeout,
                keep_failed: parts.keep_failed,
                removed: AtomicBool::new(false),
                databases: Mutex::new(HashMap::new()),
                tracked: Mutex::new(HashSet::new()),
                streamer: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    pub fn image(&self) -> &str {
        self.inner.config.image()
    }

    /// Name of the test that created the container.
    pub fn test_name(&self) -> &str {
        &self.inner.test_name
    }

    /// Registry name of the backend running the container.
    pub fn backend_name(&self) -> &str {
        &self.inner.backend_name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn keeps_failed(&self) -> bool {
        self.inner.keep_failed
    }

    /// Host published ports are reachable on.
    pub fn host(&self) -> &'static str {
        LOCALHOST
    }

    /// Host port bound to `container_port` (`"5432"` or `"5432/tcp"`).
    pub async fn port(&self, container_port: &str) -> Result<u16> {
        let info = self.inspect().await?;
        info.host_port(container_port)
            .ok_or_else(|| TestbedError::PortNotMapped(normalize_port(container_port)))
    }

    /// `host:port` for `container_port`.
    pub async fn endpoint(&self, container_port: &str) -> Result<String> {
        let port = self.port(container_port).await?;
        Ok(format!("{}:{}", self.host(), port))
    }

    /// Run a command with the harness exec timeout.
    ///
    /// A non-zero exit code is returned in the output, not as an error.
    pub async fn exec<I, S>(&self, argv: I) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_with_timeout(argv, self.inner.exec_timeout).await
    }

    pub async fn exec_with_timeout<I, S>(&self, argv: I, timeout: Duration) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let exec = self.inner.backend.exec_in_container(&self.inner.id, &argv);
        let span = container_span!("exec", self.inner.id, command = ?argv);
        let outcome = tokio::time::timeout(timeout, exec).instrument(span).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(TestbedError::ExecTimeout {
                command: argv,
                timeout,
            }),
        }
    }

    /// Everything the container has written so far.
    pub async fn logs(&self) -> Result<String> {
        self.inner.backend.container_logs(&self.inner.id).await
    }

    /// Fresh inspection snapshot.
    pub async fn inspect(&self) -> Result<ContainerInfo> {
        self.inner.backend.inspect_container(&self.inner.id).await
    }

    /// Address on the runtime's internal network, when the backend supports it.
    pub async fn internal_ip(&self) -> Result<String> {
        self.inner.backend.internal_ip(&self.inner.id).await
    }

    /// Copy a host file to `target` inside the container, mode 0644.
    pub async fn copy_file_to_container(&self, source: impl AsRef<Path>, target: &str) -> Result<()> {
        self.copy_to_container(&FileCopy::from_path(source.as_ref(), target))
            .await
    }

    pub async fn copy_to_container(&self, file: &FileCopy) -> Result<()> {
        let span = container_span!("copy", self.inner.id, target = %file.target);
        self.inner
            .backend
            .copy_to_container(&self.inner.id, file)
            .instrument(span)
            .await
    }

    /// Snapshot the container into `image`.
    pub async fn commit(&self, image: &str) -> Result<()> {
        self.inner.backend.commit(&self.inner.id, image).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.inner.backend.stop_container(&self.inner.id).await
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.backend.start_container(&self.inner.id).await
    }

    /// Remove the container. Safe to call more than once.
    pub async fn remove(&self) -> Result<()> {
        if self.inner.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_log_stream().await;

        match self.inner.backend.remove_container(&self.inner.id).await {
            Ok(()) => {
                info!(container_id = %self.inner.id, "Removed container");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(container_id = %self.inner.id, "Container already removed");
                Ok(())
            }
            Err(e) => {
                self.inner.removed.store(false, Ordering::SeqCst);
                TestbedMetrics::new().inc_container_errors(&self.inner.backend_name, "remove");
                Err(e)
            }
        }
    }

    /// Connection string for a database private to `scope`.
    ///
    /// The database is created on first use for a scope name; later calls with
    /// the same name return the same string. The database is dropped when the
    /// scope finishes.
    pub async fn dsn(&self, scope: &dyn Scope) -> Result<String> {
        let provider = self.inner.config.dsn_provider.clone().ok_or_else(|| {
            TestbedError::Config(format!(
                "container {} was created without a database provider",
                self.inner.id
            ))
        })?;
        dsn::provision(self, provider, scope).await
    }

    pub(crate) async fn cached_dsn(&self, database: &str) -> Option<String> {
        self.inner.databases.lock().await.get(database).cloned()
    }

    pub(crate) async fn cache_dsn(&self, database: &str, dsn: &str) {
        self.inner
            .databases
            .lock()
            .await
            .insert(database.to_string(), dsn.to_string());
    }

    /// Record that `database` exists. Returns false if it was already tracked.
    pub(crate) async fn track_database(&self, database: &str) -> bool {
        self.inner.tracked.lock().await.insert(database.to_string())
    }

    pub(crate) async fn forget_dsn(&self, database: &str) {
        self.inner.databases.lock().await.remove(database);
        self.inner.tracked.lock().await.remove(database);
    }

    pub(crate) fn start_log_stream(&self, filter: LogFilter, sink: Option<LogSink>) {
        let streamer = LogStreamer::spawn(
            self.inner.backend.clone(),
            self.inner.id.clone(),
            filter,
            sink,
        );
        match self.inner.streamer.lock() {
            Ok(mut slot) => *slot = Some(streamer),
            Err(_) => warn!(container_id = %self.inner.id, "Log stream slot poisoned"),
        }
    }

    /// Lines kept by the log filter so far, if streaming is enabled.
    pub fn streamed_lines(&self) -> Option<usize> {
        self.inner
            .streamer
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(LogStreamer::kept_lines))
    }

    async fn stop_log_stream(&self) {
        let streamer = self.inner.streamer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(streamer) = streamer {
            streamer.stop().await;
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("image", &self.image())
            .field("backend", &self.inner.backend_name)
            .field("removed", &self.is_removed())
            .finish()
    }
}
