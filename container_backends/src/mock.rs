//! Mock backend for testing.
//!
//! Containers live in memory. The backend enforces the same lifecycle rules
//! as a real runtime (exec needs a running container, removed containers are
//! gone) and allocates fake host ports, so the core can be exercised end to
//! end without a container runtime installed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use container_backend_interface::{Backend, LogStream};
use testbed_shared_types::{
    normalize_port, ContainerId, ContainerInfo, ContainerSpec, ContainerState, ExecOutput,
    FileCopy, FileSource, PortBinding, Result, TestbedError,
};

/// First host port handed out, the start of the ephemeral range.
const FIRST_HOST_PORT: u16 = 49152;

/// Custom exec behaviour. Returning `None` falls through to the next handler
/// and finally to the built-in commands.
pub type ExecHandler = Arc<dyn Fn(&ContainerId, &[String]) -> Option<ExecOutput> + Send + Sync>;

#[derive(Debug)]
struct MockContainer {
    id: ContainerId,
    name: String,
    spec: ContainerSpec,
    created: DateTime<Utc>,
    state: ContainerState,
    exit_code: Option<i32>,
    ports: HashMap<String, Vec<PortBinding>>,
    internal_ip: String,
    logs: String,
    log_tx: broadcast::Sender<String>,
    /// Copied files by target path, with their mode.
    files: HashMap<String, (Vec<u8>, u32)>,
}

impl MockContainer {
    fn append_log(&mut self, line: &str) {
        self.logs.push_str(line);
        self.logs.push('\n');
        // No subscribers is fine.
        let _ = self.log_tx.send(line.to_string());
    }
}

#[derive(Debug, Clone)]
struct StartupLogs {
    image_prefix: String,
    delay: Duration,
    lines: Vec<String>,
}

type Containers = Arc<RwLock<HashMap<ContainerId, MockContainer>>>;

/// Mock backend that simulates a container runtime in-memory.
pub struct MockBackend {
    containers: Containers,
    next_port: AtomicU16,
    next_ip: AtomicUsize,
    auto_start: bool,
    exec_handlers: RwLock<Vec<ExecHandler>>,
    startup_logs: RwLock<Vec<StartupLogs>>,
    failing_images: RwLock<HashSet<String>>,
    commits: RwLock<Vec<(ContainerId, String)>>,
    created: AtomicUsize,
    removed: AtomicUsize,
    execs: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
            next_port: AtomicU16::new(FIRST_HOST_PORT),
            next_ip: AtomicUsize::new(2),
            auto_start: false,
            exec_handlers: RwLock::new(Vec::new()),
            startup_logs: RwLock::new(Vec::new()),
            failing_images: RwLock::new(HashSet::new()),
            commits: RwLock::new(Vec::new()),
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
        }
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("auto_start", &self.auto_start)
            .field("created", &self.created.load(Ordering::SeqCst))
            .field("removed", &self.removed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `create_container` also starts the container.
    pub fn auto_starting() -> Self {
        Self {
            auto_start: true,
            ..Self::default()
        }
    }

    /// Register a custom exec handler. Handlers are consulted in registration order.
    pub async fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&ContainerId, &[String]) -> Option<ExecOutput> + Send + Sync + 'static,
    {
        self.exec_handlers.write().await.push(Arc::new(handler));
    }

    /// Emit `lines` to the output of every container whose image starts with
    /// `image_prefix`, `delay` after it is started.
    pub async fn with_startup_logs(
        &self,
        image_prefix: impl Into<String>,
        delay: Duration,
        lines: Vec<String>,
    ) {
        self.startup_logs.write().await.push(StartupLogs {
            image_prefix: image_prefix.into(),
            delay,
            lines,
        });
    }

    /// Make every creation of `image` fail as if the image did not exist.
    pub async fn fail_create_for(&self, image: impl Into<String>) {
        self.failing_images.write().await.insert(image.into());
    }

    /// Append a line to a container's output.
    pub async fn emit_log(&self, id: &ContainerId, line: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
        container.append_log(line);
        Ok(())
    }

    /// Simulate the main process dying.
    pub async fn kill(&self, id: &ContainerId, exit_code: i32) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
        info!("MockBackend: Killing container {} (exit code {})", id, exit_code);
        container.state = ContainerState::Stopped;
        container.exit_code = Some(exit_code);
        Ok(())
    }

    /// The creation request a container was created with (for testing).
    pub async fn spec_of(&self, id: &ContainerId) -> Option<ContainerSpec> {
        self.containers.read().await.get(id).map(|c| c.spec.clone())
    }

    /// Get the count of live containers (for testing).
    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn running_count(&self) -> usize {
        self.containers
            .read()
            .await
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .count()
    }

    pub async fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self.containers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Content and mode of a file copied into a container.
    pub async fn file_in(&self, id: &ContainerId, path: &str) -> Option<(Vec<u8>, u32)> {
        self.containers
            .read()
            .await
            .get(id)
            .and_then(|c| c.files.get(path).cloned())
    }

    /// Images committed so far, as `(container, image)` pairs.
    pub async fn commits(&self) -> Vec<(ContainerId, String)> {
        self.commits.read().await.clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    async fn start_and_emit(&self, id: &ContainerId) -> Result<()> {
        let image = {
            let mut containers = self.containers.write().await;
            let container = containers
                .get_mut(id)
                .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
            if container.state == ContainerState::Running {
                return Ok(());
            }
            container.state = ContainerState::Running;
            container.exit_code = None;
            container.spec.image.clone()
        };
        info!("MockBackend: Started container {}", id);

        let startup: Vec<StartupLogs> = self
            .startup_logs
            .read()
            .await
            .iter()
            .filter(|s| image.starts_with(&s.image_prefix))
            .cloned()
            .collect();

        for entry in startup {
            if entry.delay.is_zero() {
                let mut containers = self.containers.write().await;
                if let Some(container) = containers.get_mut(id) {
                    for line in &entry.lines {
                        container.append_log(line);
                    }
                }
            } else {
                let containers = self.containers.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(entry.delay).await;
                    let mut containers = containers.write().await;
                    if let Some(container) = containers.get_mut(&id) {
                        if container.state == ContainerState::Running {
                            for line in &entry.lines {
                                container.append_log(line);
                            }
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

/// Commands every mock container understands.
async fn builtin_exec(argv: &[String]) -> ExecOutput {
    let Some(program) = argv.first() else {
        return ExecOutput::new(126, "exec: empty command");
    };
    let args = &argv[1..];

    match program.as_str() {
        "echo" => ExecOutput::new(0, format!("{}\n", args.join(" "))),
        "true" => ExecOutput::new(0, ""),
        "false" => ExecOutput::new(1, ""),
        "sleep" => {
            let secs: f64 = args.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
            ExecOutput::new(0, "")
        }
        "sh" | "bash" if args.first().map(String::as_str) == Some("-c") => {
            let script = args.get(1).map(String::as_str).unwrap_or("").trim();
            match script.strip_prefix("exit") {
                Some(code) => ExecOutput::new(code.trim().parse().unwrap_or(0), ""),
                None => ExecOutput::new(0, ""),
            }
        }
        other => ExecOutput::new(127, format!("exec: \"{other}\": executable file not found in $PATH\n")),
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn auto_starts(&self) -> bool {
        self.auto_start
    }

    async fn create_container(
        &self,
        test_name: &str,
        image: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerId> {
        if self.failing_images.read().await.contains(image) {
            return Err(TestbedError::creation(
                image,
                format!("Unable to find image '{image}' locally"),
            ));
        }

        let id = format!("mock-container-{}", Uuid::new_v4().simple());
        info!(
            "MockBackend: Creating container {} for test {} from {}",
            id, test_name, image
        );
        debug!("Container spec: {:?}", spec);

        let ports = spec
            .ports
            .iter()
            .map(|p| {
                let binding = PortBinding {
                    host_ip: "0.0.0.0".to_string(),
                    host_port: self.allocate_port(),
                };
                (normalize_port(p), vec![binding])
            })
            .collect();

        let (log_tx, _) = broadcast::channel(1024);
        let ip_suffix = self.next_ip.fetch_add(1, Ordering::SeqCst) % 250 + 2;
        let mut stored = spec.clone();
        stored.image = image.to_string();

        let container = MockContainer {
            id: id.clone(),
            name: format!("{}-{}", test_name.replace('/', "_"), &id[15..23]),
            spec: stored,
            created: Utc::now(),
            state: ContainerState::Created,
            exit_code: None,
            ports,
            internal_ip: format!("172.17.0.{ip_suffix}"),
            logs: String::new(),
            log_tx,
            files: HashMap::new(),
        };
        self.containers.write().await.insert(id.clone(), container);
        self.created.fetch_add(1, Ordering::SeqCst);

        if self.auto_start {
            self.start_and_emit(&id).await?;
        }
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.start_and_emit(id).await
    }

    async fn stop_container(&self, id: &ContainerId) -> Result<()> {
        info!("MockBackend: Stopping container {}", id);
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
        if container.state == ContainerState::Running {
            container.state = ContainerState::Stopped;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        info!("MockBackend: Removing container {}", id);
        // Dropping the container drops its log sender, which ends every stream.
        match self.containers.write().await.remove(id) {
            Some(_) => {
                self.removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(TestbedError::NotFound(id.clone())),
        }
    }

    async fn exec_in_container(&self, id: &ContainerId, argv: &[String]) -> Result<ExecOutput> {
        {
            let containers = self.containers.read().await;
            let container = containers
                .get(id)
                .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
            if container.state != ContainerState::Running {
                return Err(TestbedError::NotRunning(id.clone()));
            }
        }
        self.execs.fetch_add(1, Ordering::SeqCst);
        debug!("MockBackend: exec {:?} in {}", argv, id);

        let handlers = self.exec_handlers.read().await.clone();
        for handler in handlers {
            if let Some(output) = handler(id, argv) {
                return Ok(output);
            }
        }
        if let [program, path] = argv {
            if program == "cat" {
                if let Some((content, _)) = self.file_in(id, path).await {
                    return Ok(ExecOutput::new(0, String::from_utf8_lossy(&content)));
                }
            }
        }
        Ok(builtin_exec(argv).await)
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let containers = self.containers.read().await;
        let c = containers
            .get(id)
            .ok_or_else(|| TestbedError::NotFound(id.clone()))?;

        let internal_ip = (c.state == ContainerState::Running).then(|| c.internal_ip.clone());
        Ok(ContainerInfo {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.spec.image.clone(),
            created: c.created,
            state: c.state,
            status: match c.state {
                ContainerState::Stopped => "exited".to_string(),
                state => state.to_string(),
            },
            exit_code: c.exit_code,
            ports: c.ports.clone(),
            internal_ip,
            labels: c.spec.labels.clone(),
        })
    }

    async fn container_logs(&self, id: &ContainerId) -> Result<String> {
        self.containers
            .read()
            .await
            .get(id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| TestbedError::NotFound(id.clone()))
    }

    async fn internal_ip(&self, id: &ContainerId) -> Result<String> {
        let containers = self.containers.read().await;
        let c = containers
            .get(id)
            .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
        if c.state != ContainerState::Running {
            return Err(TestbedError::NotRunning(id.clone()));
        }
        Ok(c.internal_ip.clone())
    }

    async fn copy_to_container(&self, id: &ContainerId, file: &FileCopy) -> Result<()> {
        let content = match &file.source {
            FileSource::Path(path) => tokio::fs::read(path).await?,
            FileSource::Content(bytes) => bytes.clone(),
        };
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| TestbedError::NotFound(id.clone()))?;
        debug!("MockBackend: Copied {} bytes to {}:{}", content.len(), id, file.target);
        container.files.insert(file.target.clone(), (content, file.mode));
        Ok(())
    }

    async fn commit(&self, id: &ContainerId, image: &str) -> Result<()> {
        if !self.containers.read().await.contains_key(id) {
            return Err(TestbedError::NotFound(id.clone()));
        }
        info!("MockBackend: Committing {} as {}", id, image);
        self.commits.write().await.push((id.clone(), image.to_string()));
        Ok(())
    }

    fn stream_logs(self: Arc<Self>, id: ContainerId) -> LogStream {
        let containers = self.containers.clone();
        let setup = async move {
            let guard = containers.read().await;
            let container = guard.get(&id)?;
            // Snapshot and subscribe under one lock so no line is lost or doubled.
            let backlog: Vec<String> = container.logs.lines().map(str::to_string).collect();
            Some((backlog, container.log_tx.subscribe()))
        };

        stream::once(setup)
            .flat_map(|subscription| match subscription {
                None => stream::empty().boxed(),
                Some((backlog, rx)) => {
                    let live = stream::unfold(rx, |mut rx| async move {
                        loop {
                            match rx.recv().await {
                                Ok(line) => return Some((line, rx)),
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    debug!("MockBackend: log stream skipped {} lines", n);
                                }
                                Err(broadcast::error::RecvError::Closed) => return None,
                            }
                        }
                    });
                    stream::iter(backlog).chain(live).boxed()
                }
            })
            .boxed()
    }
}
