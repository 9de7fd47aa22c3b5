//! Backend that drives a docker-compatible command line runtime.
//!
//! Every operation shells out to the runtime binary (`docker`, `podman` or
//! `nerdctl`) and interprets its exit status and output.
//!
//! # Requirements
//!
//! - one of the supported binaries installed and in PATH (or configured)
//! - permission to talk to the runtime daemon
//!
//! # Error classification
//!
//! The runtimes report missing or stopped containers only through stderr text,
//! so the messages `No such container` and `is not running` are mapped to
//! [`TestbedError::NotFound`] and [`TestbedError::NotRunning`]. Everything
//! else becomes [`TestbedError::Backend`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use container_backend_interface::{Backend, LogStream};
use testbed_shared_types::{
    ContainerId, ContainerInfo, ContainerSpec, ContainerState, ExecOutput, FileCopy, FileSource,
    PortBinding, Result, TestbedError, LOCALHOST,
};

/// Binaries probed, in order, when none is configured.
pub const RUNTIME_CANDIDATES: &[&str] = &["docker", "podman", "nerdctl"];

/// Errors specific to invoking the runtime binary.
#[derive(Debug, thiserror::Error)]
pub enum CliBackendError {
    #[error("Container runtime binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Runtime command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unexpected inspect output: {0}")]
    InvalidInspect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CliBackendError> for TestbedError {
    fn from(err: CliBackendError) -> Self {
        match err {
            CliBackendError::Io(e) => TestbedError::Io(e),
            CliBackendError::Json(e) => TestbedError::Json(e),
            other => TestbedError::Backend(other.to_string()),
        }
    }
}

/// Configuration for [`CliBackend`].
#[derive(Debug, Clone)]
pub struct CliBackendConfig {
    /// Runtime binary. Discovered from [`RUNTIME_CANDIDATES`] when `None`.
    pub binary: Option<PathBuf>,
    /// Timeout for lifecycle commands (default: 60s)
    pub command_timeout: Duration,
    /// Grace period given to `stop` before the runtime kills (default: 2s)
    pub stop_timeout: Duration,
    /// Label namespace used to find containers for sweeping
    pub label_prefix: String,
}

impl Default for CliBackendConfig {
    fn default() -> Self {
        Self {
            binary: None,
            command_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(2),
            label_prefix: "testbed".to_string(),
        }
    }
}

/// Docker-compatible CLI backend.
#[derive(Debug)]
pub struct CliBackend {
    config: CliBackendConfig,
    binary: PathBuf,
    name: String,
}

impl CliBackend {
    /// Create with default configuration, discovering the runtime binary.
    pub async fn new() -> std::result::Result<Self, CliBackendError> {
        Self::with_config(CliBackendConfig::default()).await
    }

    /// Create with custom configuration.
    pub async fn with_config(config: CliBackendConfig) -> std::result::Result<Self, CliBackendError> {
        let binary = match &config.binary {
            Some(binary) => {
                Self::verify_binary(binary).await?;
                binary.clone()
            }
            None => Self::discover().await?,
        };
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cli".to_string());

        info!("CliBackend initialized with binary: {:?}", binary);
        Ok(Self {
            config,
            binary,
            name,
        })
    }

    /// Find the first runtime binary on PATH that answers `--version`.
    async fn discover() -> std::result::Result<PathBuf, CliBackendError> {
        for candidate in RUNTIME_CANDIDATES {
            let path = PathBuf::from(candidate);
            if Self::verify_binary(&path).await.is_ok() {
                return Ok(path);
            }
        }
        Err(CliBackendError::BinaryNotFound(format!(
            "none of {:?} is usable",
            RUNTIME_CANDIDATES
        )))
    }

    /// Verify the binary exists and is executable.
    async fn verify_binary(binary: &Path) -> std::result::Result<(), CliBackendError> {
        let output = Command::new(binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CliBackendError::BinaryNotFound(format!("{:?}: {}", binary, e)))?;

        if !output.status.success() {
            return Err(CliBackendError::BinaryNotFound(format!(
                "{:?} returned non-zero exit code",
                binary
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Container runtime version: {}", version.trim());
        Ok(())
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Execute a runtime command with the configured timeout.
    async fn run(&self, args: &[String]) -> std::result::Result<std::process::Output, CliBackendError> {
        let cmd_str = format!("{} {}", self.name, args.join(" "));
        debug!("Executing: {}", cmd_str);

        let output = tokio::time::timeout(
            self.config.command_timeout,
            Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CliBackendError::Timeout(cmd_str))?
        .map_err(CliBackendError::Io)?;

        Ok(output)
    }

    /// Run a command that must succeed, returning trimmed stdout.
    async fn run_checked(&self, id: &str, args: &[String]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(id, &args[0], &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Every container labelled with `label_prefix` older than `max_age`.
    pub async fn find_stale(&self, max_age: Duration) -> Result<Vec<StaleContainer>> {
        let prefix = &self.config.label_prefix;
        let listed = self
            .run_checked(
                "",
                &strings(&[
                    "ps",
                    "-a",
                    "--filter",
                    &format!("label={prefix}=true"),
                    "--format",
                    "{{.ID}}",
                ]),
            )
            .await?;

        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut stale = Vec::new();

        for id in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let id = id.to_string();
            let info = match self.inspect_container(&id).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let stamped = info
                .labels
                .get(&format!("{prefix}.timestamp"))
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(info.created);
            let age = now - stamped;
            if age <= max_age {
                continue;
            }
            stale.push(StaleContainer {
                id,
                name: info.name,
                image: info.image,
                age: age.to_std().unwrap_or_default(),
            });
        }
        Ok(stale)
    }

    /// Remove every container labelled with `label_prefix` older than `max_age`.
    ///
    /// Catches containers left behind by crashed test processes. Returns the
    /// ids that were removed.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<Vec<ContainerId>> {
        let mut removed = Vec::new();
        for container in self.find_stale(max_age).await? {
            match self.remove_container(&container.id).await {
                Ok(()) => {
                    info!("Swept stale container {} ({})", container.id, container.name);
                    removed.push(container.id);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to sweep container {}: {}", container.id, e),
            }
        }
        Ok(removed)
    }
}

/// A labelled container past the age threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleContainer {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub age: Duration,
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Map a failed runtime command to the error taxonomy.
pub fn classify_failure(id: &str, command: &str, stderr: &str) -> TestbedError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        TestbedError::NotFound(id.to_string())
    } else if lower.contains("is not running") {
        TestbedError::NotRunning(id.to_string())
    } else {
        TestbedError::Backend(format!("{command} failed: {}", stderr.trim()))
    }
}

/// Container name derived from the test name, unique per creation.
pub fn container_name(test_name: &str) -> String {
    let mut base: String = test_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    if !base.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        base.insert(0, 't');
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

/// Arguments for `create`.
pub fn create_args(name: &str, image: &str, spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(&["create", "--name", name]);

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        args.push("-p".to_string());
        // Empty host port: the runtime picks a free one.
        args.push(format!("{LOCALHOST}::{port}"));
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.to_volume_arg());
    }
    if let Some(memory) = &spec.memory_limit {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(cpus) = &spec.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.clone());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(user) = &spec.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if let Some(dir) = &spec.working_dir {
        args.push("--workdir".to_string());
        args.push(dir.clone());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }

    args.push(image.to_string());
    if let Some(command) = &spec.command {
        args.extend(command.iter().cloned());
    }
    args
}

/// Subset of `inspect` output the backend reads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<String>,
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectPort>>>>,
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
    #[serde(default)]
    networks: Option<BTreeMap<String, InspectEndpoint>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPort {
    #[serde(default)]
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
}

/// Parse `inspect` JSON (an array with one entry) into a [`ContainerInfo`].
pub fn parse_inspect(json: &str) -> std::result::Result<ContainerInfo, CliBackendError> {
    let mut entries: Vec<InspectEntry> = serde_json::from_str(json)?;
    if entries.is_empty() {
        return Err(CliBackendError::InvalidInspect("empty inspect result".to_string()));
    }
    let entry = entries.swap_remove(0);

    let mut state = ContainerState::from_status(&entry.state.status);
    if entry.state.running {
        state = ContainerState::Running;
    }

    let ports = entry
        .network_settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| {
                    b.host_port.parse().ok().map(|host_port| PortBinding {
                        host_ip: b.host_ip,
                        host_port,
                    })
                })
                .collect();
            (port, bindings)
        })
        .collect();

    let internal_ip = entry
        .network_settings
        .ip_address
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            entry
                .network_settings
                .networks
                .unwrap_or_default()
                .into_values()
                .filter_map(|n| n.ip_address)
                .find(|ip| !ip.is_empty())
        });

    let created = entry
        .created
        .as_deref()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(ContainerInfo {
        id: entry.id,
        name: entry.name.trim_start_matches('/').to_string(),
        image: entry.config.image,
        created,
        state,
        status: entry.state.status,
        exit_code: entry.state.exit_code,
        ports,
        internal_ip,
        labels: entry.config.labels.unwrap_or_default(),
    })
}

#[async_trait]
impl Backend for CliBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_container(
        &self,
        test_name: &str,
        image: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerId> {
        let name = container_name(test_name);
        info!("CliBackend: Creating container {} from {}", name, image);

        let output = self.run(&create_args(&name, image, spec)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TestbedError::creation(image, stderr.trim()));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(TestbedError::creation(image, "runtime returned no container id"));
        }
        debug!("Container {} created as {}", name, id);
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.run_checked(id, &strings(&["start", id])).await?;
        debug!("Container {} started", id);
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId) -> Result<()> {
        info!("CliBackend: Stopping container {}", id);
        let grace = self.config.stop_timeout.as_secs().max(1).to_string();
        match self.run_checked(id, &strings(&["stop", "--time", &grace, id])).await {
            Ok(_) => Ok(()),
            Err(e @ TestbedError::NotFound(_)) => Err(e),
            Err(e) => {
                warn!("Stop of {} failed ({}), sending kill", id, e);
                match self.run_checked(id, &strings(&["kill", id])).await {
                    Ok(_) | Err(TestbedError::NotRunning(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        info!("CliBackend: Removing container {}", id);
        // `rm -f` stops a running container first.
        self.run_checked(id, &strings(&["rm", "-f", "-v", id])).await?;
        Ok(())
    }

    async fn exec_in_container(&self, id: &ContainerId, argv: &[String]) -> Result<ExecOutput> {
        let mut args = strings(&["exec", id]);
        args.extend(argv.iter().cloned());
        let output = self.run(&args).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code != 0 && stderr.starts_with("Error") {
            match classify_failure(id, "exec", &stderr) {
                e @ (TestbedError::NotFound(_) | TestbedError::NotRunning(_)) => return Err(e),
                _ => {}
            }
        }
        Ok(ExecOutput::new(exit_code, format!("{stdout}{stderr}")))
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let json = self
            .run_checked(id, &strings(&["inspect", "--type", "container", id]))
            .await?;
        Ok(parse_inspect(&json)?)
    }

    async fn container_logs(&self, id: &ContainerId) -> Result<String> {
        let output = self.run(&strings(&["logs", id])).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_failure(id, "logs", &stderr));
        }
        Ok(format!("{}{}", String::from_utf8_lossy(&output.stdout), stderr))
    }

    async fn internal_ip(&self, id: &ContainerId) -> Result<String> {
        let info = self.inspect_container(id).await?;
        if !info.is_running() {
            return Err(TestbedError::NotRunning(id.clone()));
        }
        info.internal_ip
            .ok_or_else(|| TestbedError::backend(format!("container {id} has no network address")))
    }

    async fn copy_to_container(&self, id: &ContainerId, file: &FileCopy) -> Result<()> {
        if let Some(dir) = file.parent_dir() {
            let mkdir = strings(&["exec", id, "mkdir", "-p", dir]);
            if let Err(e) = self.run_checked(id, &mkdir).await {
                if e.is_container_gone() {
                    return Err(e);
                }
                debug!("mkdir -p {} in {} failed: {}", dir, id, e);
            }
        }

        let (source, staged) = match &file.source {
            FileSource::Path(path) => (path.clone(), None),
            FileSource::Content(bytes) => {
                let path = std::env::temp_dir().join(format!("testbed-cp-{}", Uuid::new_v4().simple()));
                tokio::fs::write(&path, bytes).await?;
                (path.clone(), Some(path))
            }
        };

        let cp = vec![
            "cp".to_string(),
            source.display().to_string(),
            format!("{}:{}", id, file.target),
        ];
        let copied = self.run_checked(id, &cp).await;
        if let Some(path) = staged {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("Failed to remove staged file {}: {}", path.display(), e);
            }
        }
        copied?;

        if file.mode != FileCopy::DEFAULT_MODE {
            let mode = format!("{:o}", file.mode);
            self.run_checked(id, &strings(&["exec", id, "chmod", &mode, &file.target]))
                .await?;
        }
        debug!("Copied {} into {}", file.target, id);
        Ok(())
    }

    async fn commit(&self, id: &ContainerId, image: &str) -> Result<()> {
        info!("CliBackend: Committing {} as {}", id, image);
        self.run_checked(id, &strings(&["commit", id, image])).await?;
        Ok(())
    }

    fn stream_logs(self: Arc<Self>, id: ContainerId) -> LogStream {
        let (tx, rx) = mpsc::channel::<String>(256);
        let binary = self.binary.clone();

        tokio::spawn(async move {
            let child = Command::new(&binary)
                .args(["logs", "--follow", id.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    warn!("Failed to follow logs of {}: {}", id, e);
                    return;
                }
            };
            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                return;
            };
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let (mut out_done, mut err_done) = (false, false);

            loop {
                let line = tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(line)) => Some(line),
                        _ => {
                            out_done = true;
                            None
                        }
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(line)) => Some(line),
                        _ => {
                            err_done = true;
                            None
                        }
                    },
                    _ = tx.closed() => break,
                };
                if let Some(line) = line {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                if out_done && err_done {
                    break;
                }
            }
            debug!("Log follower for {} finished", id);
            // Dropping the child kills `logs --follow` if it is still attached.
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) }).boxed()
    }
}
