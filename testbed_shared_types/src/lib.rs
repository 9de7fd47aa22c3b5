//! Types shared by every crate in the testbed workspace.
//!
//! The creation request handed to a backend ([`ContainerSpec`]), the inspection
//! snapshot a backend returns ([`ContainerInfo`]) and the error taxonomy
//! ([`TestbedError`]) live here so that backends never depend on the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Identifier issued by a backend for a created container.
pub type ContainerId = String;

/// Host every published port is reachable on.
pub const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum TestbedError {
    /// Image missing or the runtime rejected the configuration. Never retried.
    #[error("Container creation failed for image {image}: {reason}")]
    Creation { image: String, reason: String },

    #[error("Container is not running: {0}")]
    NotRunning(ContainerId),

    #[error("Container not found: {0}")]
    NotFound(ContainerId),

    #[error("Timed out after {elapsed:?} waiting for {condition}{}", format_recent_output(.recent_output))]
    WaitTimeout {
        condition: String,
        elapsed: Duration,
        /// Tail of the container output at the time of the timeout.
        recent_output: String,
    },

    #[error("Exec of {command:?} timed out after {timeout:?}")]
    ExecTimeout { command: Vec<String>, timeout: Duration },

    #[error("Failed to create database for test {test} after {attempts} attempts: {last_error}")]
    DsnCreation {
        test: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Backend {0:?} is not registered")]
    BackendNotRegistered(String),

    #[error("Backend {backend} does not support {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Container port {0} has no host binding")]
    PortNotMapped(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TestbedError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn creation(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Creation {
            image: image.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// True for the two timeout kinds (readiness and exec).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. } | Self::ExecTimeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when the container can no longer serve requests at all.
    pub fn is_container_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotRunning(_))
    }
}

pub type Result<T> = std::result::Result<T, TestbedError>;

fn format_recent_output(recent: &str) -> String {
    if recent.trim().is_empty() {
        "\nNo output from container".to_string()
    } else {
        format!("\nLast lines of container output:\n{recent}")
    }
}

/// Last `n` non-empty lines of `output`, joined with newlines.
pub fn tail_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Lifecycle state as reported by a backend inspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Unknown,
}

impl ContainerState {
    /// Map a runtime status string (docker/podman vocabulary) to a state.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" => Self::Created,
            "running" | "restarting" | "paused" => Self::Running,
            "exited" | "stopped" | "dead" | "removing" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Render as a `-v` style `host:container[:ro]` string.
    pub fn to_volume_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Where the bytes of a copied file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// A file on the host, read at copy time.
    Path(PathBuf),
    Content(Vec<u8>),
}

/// A file placed into a container after it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub source: FileSource,
    /// Absolute path inside the container. Parent directories are created.
    pub target: String,
    /// Unix permission bits.
    pub mode: u32,
}

impl FileCopy {
    pub const DEFAULT_MODE: u32 = 0o644;

    pub fn from_path(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: FileSource::Path(source.into()),
            target: target.into(),
            mode: Self::DEFAULT_MODE,
        }
    }

    pub fn from_content(content: impl Into<Vec<u8>>, target: impl Into<String>, mode: u32) -> Self {
        Self {
            source: FileSource::Content(content.into()),
            target: target.into(),
            mode,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Directory holding the target, when there is one to create.
    pub fn parent_dir(&self) -> Option<&str> {
        let trimmed = self.target.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) | None => None,
            Some(idx) => Some(&trimmed[..idx]),
        }
    }
}

/// Everything a backend needs to allocate a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Container ports to publish, e.g. `"5432"` or `"53/udp"`.
    pub ports: Vec<String>,
    /// Replaces the image's default command when set.
    pub command: Option<Vec<String>>,
    pub mounts: Vec<Mount>,
    /// Runtime memory limit, e.g. `"512m"`.
    pub memory_limit: Option<String>,
    /// Runtime CPU limit, e.g. `"1.5"`.
    pub cpus: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub privileged: bool,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// A host binding for a published container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: u16,
}

/// Inspection snapshot. Re-fetched on every inspect, never cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub state: ContainerState,
    pub status: String,
    pub exit_code: Option<i32>,
    /// Keyed by normalized container port (`"5432/tcp"`).
    pub ports: HashMap<String, Vec<PortBinding>>,
    pub internal_ip: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// First host port bound to `container_port`, if any.
    pub fn host_port(&self, container_port: &str) -> Option<u16> {
        self.ports
            .get(&normalize_port(container_port))
            .and_then(|bindings| bindings.first())
            .map(|b| b.host_port)
    }
}

/// Result of running a program inside a container.
///
/// A non-zero exit code is a program failure, not a transport error, so it is
/// reported here rather than as an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Append `/tcp` when no protocol is given.
pub fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{port}/tcp")
    }
}

/// Make a value safe for use as a container label.
pub fn sanitize_label_value(value: &str) -> String {
    const MAX_LABEL_VALUE_LEN: usize = 63;
    let sanitized: String = value
        .chars()
        .map(|c| match c {
            '/' => '_',
            ':' => '-',
            c => c,
        })
        .collect();
    sanitized.chars().take(MAX_LABEL_VALUE_LEN).collect()
}

/// Shorten an id for log output.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_port() {
        assert_eq!(normalize_port("5432"), "5432/tcp");
        assert_eq!(normalize_port("53/udp"), "53/udp");
    }

    #[test]
    fn test_state_from_status() {
        assert_eq!(ContainerState::from_status("running"), ContainerState::Running);
        assert_eq!(ContainerState::from_status("Exited"), ContainerState::Stopped);
        assert_eq!(ContainerState::from_status("created"), ContainerState::Created);
        assert_eq!(ContainerState::from_status("weird"), ContainerState::Unknown);
    }

    #[test]
    fn test_host_port_lookup() {
        let mut ports = HashMap::new();
        ports.insert(
            "6379/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: 49153,
            }],
        );
        let info = ContainerInfo {
            id: "abc".to_string(),
            name: "redis".to_string(),
            image: "redis:7".to_string(),
            created: Utc::now(),
            state: ContainerState::Running,
            status: "running".to_string(),
            exit_code: None,
            ports,
            internal_ip: None,
            labels: BTreeMap::new(),
        };
        assert_eq!(info.host_port("6379"), Some(49153));
        assert_eq!(info.host_port("6380"), None);
        assert!(info.is_running());
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("TestFoo/sub:1"), "TestFoo_sub-1");
        assert_eq!(sanitize_label_value(&"x".repeat(100)).len(), 63);
    }

    #[test]
    fn test_error_predicates() {
        let err = TestbedError::WaitTimeout {
            condition: "log \"ready\"".to_string(),
            elapsed: Duration::from_secs(1),
            recent_output: String::new(),
        };
        assert!(err.to_string().contains("No output from container"));
        assert!(err.is_timeout());
        assert!(!err.is_not_found());
        assert!(TestbedError::NotRunning("x".into()).is_container_gone());
    }

    #[test]
    fn test_tail_lines() {
        let out = "a\nb\n\nc\nd\n";
        assert_eq!(tail_lines(out, 2), "c\nd");
        assert_eq!(tail_lines(out, 10), "a\nb\nc\nd");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_file_copy_parent_dir() {
        let file = FileCopy::from_path("/tmp/init.sql", "/docker-entrypoint-initdb.d/init.sql");
        assert_eq!(file.parent_dir(), Some("/docker-entrypoint-initdb.d"));
        assert_eq!(file.mode, 0o644);
        assert_eq!(FileCopy::from_content("x", "/top.txt", 0o600).parent_dir(), None);
        assert_eq!(FileCopy::from_content("x", "relative", 0o600).parent_dir(), None);
    }

    #[test]
    fn test_mount_volume_arg() {
        let m = Mount {
            host_path: "/tmp/a".into(),
            container_path: "/data".into(),
            read_only: true,
        };
        assert_eq!(m.to_volume_arg(), "/tmp/a:/data:ro");
    }
}
