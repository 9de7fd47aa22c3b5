//! Container creation.
//!
//! A [`Harness`] owns the backend registry and the process settings. It is
//! built once per test binary and shared by every test.

use crate::container::{Container, ContainerParts};
use crate::gate::StartupGate;
use crate::options::{Config, ContainerOption};
use crate::scope::{Scope, ScopeExt};
use crate::wait::wait_until_ready;
use chrono::{SecondsFormat, Utc};
use container_backend_interface::{Backend, BackendRegistry};
use observability::TestbedMetrics;
use std::sync::Arc;
use testbed_config::Settings;
use testbed_shared_types::{sanitize_label_value, short_id, Result, TestbedError};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

#[cfg(feature = "cli-backend")]
use container_backends::{CliBackend, CliBackendConfig, StaleContainer};
#[cfg(feature = "cli-backend")]
use tokio::sync::OnceCell;
#[cfg(feature = "mock-backend")]
use container_backends::MockBackend;

/// Names the runtime CLI driver is registered under.
pub const CLI_BACKEND_ALIASES: &[&str] = &["docker", "podman", "nerdctl", "cli", "local"];

/// Name of the in-memory backend.
pub const MOCK_BACKEND: &str = "mock";

/// Leftover containers are checked once per process.
#[cfg(feature = "cli-backend")]
static STALE_CHECK: OnceCell<()> = OnceCell::const_new();

pub struct Harness {
    registry: BackendRegistry,
    settings: Settings,
    slots: Arc<Semaphore>,
    metrics: TestbedMetrics,
}

impl Harness {
    /// Harness over an explicit registry. `settings.backend` becomes the
    /// registry default when it is registered.
    pub fn new(mut registry: BackendRegistry, settings: Settings) -> Self {
        if registry.contains(&settings.backend) {
            // Presence was just checked.
            let _ = registry.set_default(&settings.backend);
        } else {
            warn!(
                "Configured backend {:?} is not registered (available: {:?})",
                settings.backend,
                registry.names()
            );
        }
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_starts.max(1)));
        Self {
            registry,
            settings,
            slots,
            metrics: TestbedMetrics::new(),
        }
    }

    /// Harness with a single backend registered under `name` and selected.
    pub fn with_backend(name: &str, backend: Arc<dyn Backend>, mut settings: Settings) -> Result<Self> {
        let mut registry = BackendRegistry::new();
        registry.register(name, backend)?;
        settings.backend = name.to_string();
        Ok(Self::new(registry, settings))
    }

    /// Settings from the environment, with every built-in backend registered.
    pub async fn from_env() -> Result<Self> {
        let settings = Settings::load()?;
        Self::from_settings(settings).await
    }

    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let mut registry = BackendRegistry::new();

        #[cfg(feature = "cli-backend")]
        {
            let config = CliBackendConfig {
                binary: settings.runtime_binary.clone(),
                label_prefix: settings.label_prefix.clone(),
                ..CliBackendConfig::default()
            };
            match CliBackend::with_config(config).await {
                Ok(cli) => {
                    if settings.warn_old || settings.cleanup_old {
                        STALE_CHECK
                            .get_or_init(|| check_stale_containers(&cli, &settings))
                            .await;
                    }
                    let cli: Arc<dyn Backend> = Arc::new(cli);
                    for alias in CLI_BACKEND_ALIASES {
                        registry.register(*alias, cli.clone())?;
                    }
                }
                Err(e) => warn!("No container runtime CLI available: {}", e),
            }
        }

        #[cfg(feature = "mock-backend")]
        registry.register(MOCK_BACKEND, Arc::new(MockBackend::new()))?;

        Ok(Self::new(registry, settings))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Creation slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// A one-at-a-time startup gate settling for the configured create delay.
    pub fn serial_gate(&self, name: impl Into<String>) -> StartupGate {
        StartupGate::serial(name, self.settings.create_delay)
    }

    /// Create a container for `scope`, start it and wait until it is ready.
    ///
    /// Removal is registered with `scope` as soon as the backend has issued an
    /// id, so a failure at any later step still cleans up. When the scope
    /// ends failed and `keep_failed` is set, the container is left running.
    pub async fn new_container<I>(&self, scope: &dyn Scope, image: &str, options: I) -> Result<Container>
    where
        I: IntoIterator<Item = ContainerOption>,
    {
        let mut config = Config::build(image, options);
        self.apply_labels(&mut config, scope.name());

        let requested = config
            .backend
            .clone()
            .unwrap_or_else(|| self.settings.backend.clone());
        let (backend_name, backend) = self.registry.resolve(Some(&requested))?;

        let span = tracing::info_span!(
            "create_container",
            image = %image,
            backend = %backend_name,
            test = %scope.name()
        );
        self.create_and_wait(scope, config, backend_name, backend)
            .instrument(span)
            .await
    }

    async fn create_and_wait(
        &self,
        scope: &dyn Scope,
        config: Config,
        backend_name: String,
        backend: Arc<dyn Backend>,
    ) -> Result<Container> {
        let image = config.image().to_string();

        let slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| TestbedError::backend("creation slots closed"))?;
        let gate_permit = match &config.startup_gate {
            Some(gate) => Some(gate.admit().await?),
            None => None,
        };

        let id = match backend.create_container(scope.name(), &image, &config.spec).await {
            Ok(id) => id,
            Err(e) => {
                self.metrics.inc_container_errors(&backend_name, "create");
                return Err(e);
            }
        };
        debug!(container_id = %short_id(&id), "Container created");

        let wait = config.wait.clone();
        let files = config.files.clone();
        let post_start = config.post_start.clone();
        let startup_timeout = config.startup_timeout;
        let stream = config.stream_logs.then(|| config.log_filter.clone());
        let container = Container::new(ContainerParts {
            id,
            test_name: scope.name().to_string(),
            backend_name: backend_name.clone(),
            backend: backend.clone(),
            config,
            exec_timeout: self.settings.exec_timeout,
            keep_failed: self.settings.keep_failed,
        });
        self.register_removal(scope, &container);

        if !backend.auto_starts() {
            if let Err(e) = backend.start_container(container.id()).await {
                self.metrics.inc_container_errors(&backend_name, "start");
                self.discard(&container).await;
                return Err(e);
            }
        }
        drop(gate_permit);
        drop(slot);

        for file in &files {
            if let Err(e) = container.copy_to_container(file).await {
                self.metrics.inc_container_errors(&backend_name, "copy");
                self.discard(&container).await;
                return Err(e);
            }
        }

        if let Some(filter) = stream {
            let sink = self.settings.verbose.then(|| scope.log_sink());
            container.start_log_stream(filter, sink);
        }

        if let Some(condition) = wait {
            let deadline = startup_timeout.map(|t| Instant::now() + t);
            if let Err(e) = wait_until_ready(backend.as_ref(), container.id(), &condition, deadline).await {
                self.metrics.inc_container_errors(&backend_name, "wait");
                self.discard(&container).await;
                return Err(e);
            }
        }

        if let Some(hook) = post_start {
            if let Err(e) = hook(container.clone()).await {
                self.metrics.inc_container_errors(&backend_name, "post_start");
                self.discard(&container).await;
                return Err(e);
            }
        }

        self.metrics.inc_containers_created(&backend_name, &image);
        info!(container_id = %short_id(container.id()), "Container {} ready", image);
        if self.settings.verbose {
            scope.log(&format!("started {} as {}", image, short_id(container.id())));
        }
        Ok(container)
    }

    fn apply_labels(&self, config: &mut Config, test_name: &str) {
        let prefix = &self.settings.label_prefix;
        let image = sanitize_label_value(config.image());
        let labels = &mut config.spec.labels;
        labels.insert(prefix.clone(), "true".to_string());
        labels.insert(format!("{prefix}.testname"), sanitize_label_value(test_name));
        labels.insert(format!("{prefix}.image"), image);
        labels.insert(
            format!("{prefix}.timestamp"),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    fn register_removal(&self, scope: &dyn Scope, container: &Container) {
        let container = container.clone();
        let keep_failed = self.settings.keep_failed;
        let metrics = self.metrics;
        let sink = scope.log_sink();
        scope.defer(move |exit| async move {
            if exit.failed && keep_failed {
                sink(&format!(
                    "keeping container {} ({}) of failed test",
                    short_id(container.id()),
                    container.image()
                ));
                return;
            }
            if let Err(e) = container.remove().await {
                warn!(container_id = %container.id(), error = %e, "Failed to remove container");
                metrics.inc_cleanup_failures("container");
            }
        });
    }

    /// Best-effort removal after a failed creation step.
    async fn discard(&self, container: &Container) {
        if let Err(e) = container.remove().await {
            warn!(container_id = %container.id(), error = %e, "Failed to remove container after failed start");
        }
    }
}

/// Warn about and optionally remove containers left by earlier runs.
#[cfg(feature = "cli-backend")]
async fn check_stale_containers(cli: &CliBackend, settings: &Settings) {
    let stale = match cli.find_stale(settings.cleanup_age).await {
        Ok(stale) => stale,
        Err(e) => {
            warn!("Failed to list containers for the stale check: {}", e);
            return;
        }
    };
    if settings.warn_old {
        for container in &stale {
            warn!("{}", stale_warning(container, settings.cleanup_old));
        }
    }
    if !settings.cleanup_old {
        return;
    }
    let mut removed = 0;
    for container in &stale {
        match cli.remove_container(&container.id).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to remove stale container {}: {}", short_id(&container.id), e),
        }
    }
    if removed > 0 {
        info!("Removed {} stale containers older than {:?}", removed, settings.cleanup_age);
    }
}

#[cfg(feature = "cli-backend")]
fn stale_warning(container: &StaleContainer, cleaning: bool) -> String {
    let age = std::time::Duration::from_secs(container.age.as_secs());
    let hint = if cleaning {
        "removing it"
    } else {
        "set TESTBED_CLEANUP_OLD=1 to remove it"
    };
    format!(
        "Found old container {} ({}, {}) created {:?} ago; {}",
        container.name,
        short_id(&container.id),
        container.image,
        age,
        hint
    )
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("registry", &self.registry)
            .field("backend", &self.settings.backend)
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options;
    use crate::scope::TestScope;
    use container_backends::MockBackend;
    use std::time::Duration;

    fn mock_harness(settings: Settings) -> (Harness, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new());
        let harness = Harness::with_backend(MOCK_BACKEND, mock.clone(), settings).unwrap();
        (harness, mock)
    }

    #[tokio::test]
    async fn test_labels_and_spec_reach_backend() {
        let (harness, mock) = mock_harness(Settings::default());
        let scope = TestScope::new("TestLabels/sub");
        let container = harness
            .new_container(&scope, "alpine:3", [options::env("A", "1"), options::port("8080")])
            .await
            .unwrap();

        let spec = mock.spec_of(container.id()).await.unwrap();
        assert_eq!(spec.env["A"], "1");
        assert_eq!(spec.labels["testbed"], "true");
        assert_eq!(spec.labels["testbed.testname"], "TestLabels_sub");
        assert_eq!(spec.labels["testbed.image"], "alpine-3");
        assert!(spec.labels.contains_key("testbed.timestamp"));
        assert_eq!(container.backend_name(), MOCK_BACKEND);

        scope.finish().await;
        assert_eq!(mock.container_count().await, 0);
    }

    #[test]
    fn test_serial_gate_uses_create_delay() {
        let settings = Settings {
            create_delay: Duration::from_millis(750),
            ..Settings::default()
        };
        let (harness, _mock) = mock_harness(settings);
        let gate = harness.serial_gate("mysql");
        assert_eq!(gate.name(), "mysql");
        assert_eq!(gate.capacity(), 1);
        assert_eq!(gate.settle_delay(), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_reported() {
        let (harness, _mock) = mock_harness(Settings::default());
        let scope = TestScope::new("TestUnknown");
        let err = harness
            .new_container(&scope, "alpine:3", [options::backend("kubernetes")])
            .await
            .unwrap_err();
        assert!(matches!(err, TestbedError::BackendNotRegistered(name) if name == "kubernetes"));
    }

    #[tokio::test]
    async fn test_create_failure_leaves_nothing_behind() {
        let (harness, mock) = mock_harness(Settings::default());
        mock.fail_create_for("missing:latest").await;
        let scope = TestScope::new("TestMissing");
        let err = harness
            .new_container(&scope, "missing:latest", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TestbedError::Creation { .. }));
        assert_eq!(scope.pending_actions(), 0);
        assert_eq!(mock.container_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_failure_removes_container() {
        let (harness, mock) = mock_harness(Settings::default());
        let scope = TestScope::new("TestNeverReady");
        let err = harness
            .new_container(
                &scope,
                "postgres:15-alpine",
                [options::wait_for_log("never", Duration::from_secs(1))],
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mock.container_count().await, 0);

        // The registered removal is now a no-op.
        scope.finish().await;
        assert_eq!(mock.removed_count(), 1);
    }

    #[tokio::test]
    async fn test_slots_are_released() {
        let settings = Settings {
            max_concurrent_starts: 2,
            ..Settings::default()
        };
        let (harness, _mock) = mock_harness(settings);
        let scope = TestScope::new("TestSlots");
        for _ in 0..3 {
            harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();
        }
        assert_eq!(harness.available_slots(), 2);
        scope.finish().await;
    }

    #[tokio::test]
    async fn test_verbose_streams_into_scope() {
        let settings = Settings {
            verbose: true,
            ..Settings::default()
        };
        let (harness, mock) = mock_harness(settings);
        let scope = TestScope::new("TestVerbose");
        let container = harness
            .new_container(&scope, "alpine:3", [options::with_logs()])
            .await
            .unwrap();
        mock.emit_log(container.id(), "hello from container").await.unwrap();

        for _ in 0..100 {
            if container.streamed_lines() == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scope.logs().iter().any(|l| l.ends_with("hello from container")));
        scope.finish().await;
    }

    #[cfg(feature = "cli-backend")]
    #[test]
    fn test_stale_warning_mentions_cleanup_flag() {
        let container = StaleContainer {
            id: "0123456789abcdef".to_string(),
            name: "TestOld-1a2b3c4d".to_string(),
            image: "redis:7".to_string(),
            age: Duration::from_millis(421_700),
        };
        let warning = stale_warning(&container, false);
        assert!(warning.contains("TestOld-1a2b3c4d (0123456789ab, redis:7)"));
        assert!(warning.contains("421s ago"));
        assert!(warning.contains("TESTBED_CLEANUP_OLD=1"));
        assert!(stale_warning(&container, true).ends_with("removing it"));
    }

    #[tokio::test]
    async fn test_files_copied_after_start() {
        let (harness, mock) = mock_harness(Settings::default());
        let scope = TestScope::new("TestFiles");
        let container = harness
            .new_container(
                &scope,
                "alpine:3",
                [options::copy_string("listen 8080\n", "/etc/app/app.conf", 0o600)],
            )
            .await
            .unwrap();

        assert_eq!(
            mock.file_in(container.id(), "/etc/app/app.conf").await,
            Some((b"listen 8080\n".to_vec(), 0o600))
        );
        let out = container.exec(["cat", "/etc/app/app.conf"]).await.unwrap();
        assert_eq!(out.output, "listen 8080\n");
        scope.finish().await;
    }

    #[tokio::test]
    async fn test_failed_copy_removes_container() {
        let (harness, mock) = mock_harness(Settings::default());
        let scope = TestScope::new("TestBadCopy");
        let err = harness
            .new_container(
                &scope,
                "alpine:3",
                [options::copy_file("/no/such/host/file", "/etc/missing")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TestbedError::Io(_)));
        assert_eq!(mock.container_count().await, 0);
        scope.finish().await;
    }

    #[tokio::test]
    async fn test_post_start_runs_on_ready_container() {
        let (harness, mock) = mock_harness(Settings::default());
        mock.with_startup_logs("redis", Duration::ZERO, vec!["Ready to accept connections".into()])
            .await;
        let scope = TestScope::new("TestPostStart");
        let container = harness
            .new_container(
                &scope,
                "redis:7",
                [
                    options::wait_for_log("Ready to accept", Duration::from_secs(5)),
                    options::post_start(|c| async move {
                        let logs = c.logs().await?;
                        assert!(logs.contains("Ready to accept"));
                        c.copy_to_container(&testbed_shared_types::FileCopy::from_content(
                            "seeded",
                            "/data/marker",
                            0o644,
                        ))
                        .await
                    }),
                ],
            )
            .await
            .unwrap();
        assert!(mock.file_in(container.id(), "/data/marker").await.is_some());
        scope.finish().await;
    }

    #[tokio::test]
    async fn test_post_start_failure_removes_container() {
        let (harness, mock) = mock_harness(Settings::default());
        let scope = TestScope::new("TestPostStartFails");
        let err = harness
            .new_container(
                &scope,
                "alpine:3",
                [options::post_start(|_| async {
                    Err(TestbedError::Config("seed failed".into()))
                })],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TestbedError::Config(msg) if msg == "seed failed"));
        assert_eq!(mock.container_count().await, 0);
        scope.finish().await;
    }
}
