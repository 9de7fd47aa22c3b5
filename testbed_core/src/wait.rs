//! Readiness conditions evaluated before a container handle is returned.

use container_backend_interface::{Backend, DIAGNOSTIC_TAIL_LINES};
use observability::TestbedMetrics;
use std::fmt;
use std::time::Duration;
use testbed_shared_types::{tail_lines, ContainerId, Result, TestbedError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Interval between exec probe attempts.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for a single probe exec.
pub const PROBE_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// The container output contains `pattern`.
    LogPattern { pattern: String, timeout: Duration },
    /// `command` run inside the container exits zero.
    ExecProbe { command: Vec<String>, timeout: Duration },
    /// Every condition in order, each with its own timeout.
    All(Vec<WaitCondition>),
}

impl WaitCondition {
    pub fn log(pattern: impl Into<String>, timeout: Duration) -> Self {
        Self::LogPattern {
            pattern: pattern.into(),
            timeout,
        }
    }

    pub fn exec<I, S>(command: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ExecProbe {
            command: command.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// Metric label for the condition kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LogPattern { .. } => "log",
            Self::ExecProbe { .. } => "exec",
            Self::All(_) => "all",
        }
    }

    /// Worst-case time the condition may take.
    pub fn total_timeout(&self) -> Duration {
        match self {
            Self::LogPattern { timeout, .. } | Self::ExecProbe { timeout, .. } => *timeout,
            Self::All(conditions) => conditions.iter().map(Self::total_timeout).sum(),
        }
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogPattern { pattern, .. } => write!(f, "log pattern {pattern:?}"),
            Self::ExecProbe { command, .. } => write!(f, "exec probe {:?}", command.join(" ")),
            Self::All(conditions) => {
                let parts: Vec<String> = conditions.iter().map(ToString::to_string).collect();
                write!(f, "all of [{}]", parts.join(", "))
            }
        }
    }
}

/// Block until `condition` holds for container `id`.
///
/// `deadline` caps the whole evaluation on top of each condition's own
/// timeout. Timeouts come back as [`TestbedError::WaitTimeout`] carrying the
/// tail of the container output; a container that dies while being probed
/// fails immediately.
pub async fn wait_until_ready(
    backend: &dyn Backend,
    id: &ContainerId,
    condition: &WaitCondition,
    deadline: Option<Instant>,
) -> Result<()> {
    let started = Instant::now();
    let timer = TestbedMetrics::new().wait_timer(condition.kind());
    let result = evaluate(backend, id, condition, deadline).await;
    drop(timer);
    if result.is_ok() {
        info!(container_id = %id, condition = %condition, elapsed = ?started.elapsed(), "Container ready");
    }
    result
}

async fn evaluate(
    backend: &dyn Backend,
    id: &ContainerId,
    condition: &WaitCondition,
    deadline: Option<Instant>,
) -> Result<()> {
    match condition {
        WaitCondition::LogPattern { pattern, timeout } => {
            let timeout = bounded(*timeout, deadline);
            debug!(container_id = %id, pattern = %pattern, ?timeout, "Waiting for log pattern");
            backend.wait_for_log(id, pattern, timeout).await
        }
        WaitCondition::ExecProbe { command, timeout } => {
            probe(backend, id, command, bounded(*timeout, deadline)).await
        }
        WaitCondition::All(conditions) => {
            for condition in conditions {
                Box::pin(evaluate(backend, id, condition, deadline)).await?;
            }
            Ok(())
        }
    }
}

fn bounded(timeout: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
        None => timeout,
    }
}

async fn probe(
    backend: &dyn Backend,
    id: &ContainerId,
    command: &[String],
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last_result = String::from("no attempt completed");
    debug!(container_id = %id, command = ?command, ?timeout, "Waiting for exec probe");

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout(
            remaining.min(PROBE_EXEC_TIMEOUT),
            backend.exec_in_container(id, command),
        )
        .await;
        match attempt {
            Ok(Ok(output)) if output.success() => return Ok(()),
            Ok(Ok(output)) => {
                last_result = format!("exit code {}: {}", output.exit_code, output.output.trim());
            }
            Ok(Err(e)) if e.is_container_gone() => return Err(e),
            Ok(Err(e)) => last_result = e.to_string(),
            Err(_) => last_result = "probe exec timed out".to_string(),
        }

        let now = Instant::now();
        if now >= deadline {
            let output = backend.container_logs(id).await.unwrap_or_default();
            return Err(TestbedError::WaitTimeout {
                condition: format!(
                    "exec probe {:?} (last attempt: {})",
                    command.join(" "),
                    last_result
                ),
                elapsed: now - started,
                recent_output: tail_lines(&output, DIAGNOSTIC_TAIL_LINES),
            });
        }
        tokio::time::sleep(PROBE_INTERVAL.min(deadline - now)).await;
    }
}
