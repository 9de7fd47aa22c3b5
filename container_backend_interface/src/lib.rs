//! The contract every container runtime backend implements.
//!
//! Backends are stateless service objects shared by all containers created
//! through them. They are looked up by name in a [`BackendRegistry`] once per
//! container creation.

mod registry;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::time::Instant;
use tracing::debug;

pub use registry::BackendRegistry;
pub use testbed_shared_types::{
    ContainerId, ContainerInfo, ContainerSpec, ContainerState, ExecOutput, FileCopy, FileSource,
    Result, TestbedError,
};

/// Interval between log checks when waiting for a log line.
pub const DEFAULT_LOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lines of container output kept in timeout diagnostics.
pub const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Container output, one line per item. Ends when the container goes away or
/// the runtime closes the stream.
pub type LogStream = BoxStream<'static, String>;

/// Trait for driving a container runtime (docker CLI, an in-memory simulation, ...).
///
/// Rules every implementation follows:
/// - operations on an unknown id fail with [`TestbedError::NotFound`];
/// - `start_container` on a running container is not an error;
/// - a program that runs and fails inside the container is reported through
///   [`ExecOutput::exit_code`], not through `Err`.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// True when `create_container` also starts the container.
    fn auto_starts(&self) -> bool {
        false
    }

    /// Allocates a container for `image` on behalf of the test `test_name`.
    async fn create_container(
        &self,
        test_name: &str,
        image: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerId>;

    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    async fn stop_container(&self, id: &ContainerId) -> Result<()>;

    /// Releases the container. Every later operation on `id` fails with `NotFound`.
    async fn remove_container(&self, id: &ContainerId) -> Result<()>;

    async fn exec_in_container(&self, id: &ContainerId, argv: &[String]) -> Result<ExecOutput>;

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo>;

    /// All output produced by the container so far.
    async fn container_logs(&self, id: &ContainerId) -> Result<String>;

    /// Waits until `substring` shows up in the container output.
    async fn wait_for_log(&self, id: &ContainerId, substring: &str, timeout: Duration) -> Result<()> {
        wait_for_log_by_polling(self, id, substring, timeout, DEFAULT_LOG_POLL_INTERVAL).await
    }

    /// Address of the container on its runtime network.
    async fn internal_ip(&self, id: &ContainerId) -> Result<String> {
        let _ = id;
        Err(TestbedError::unsupported(self.name(), "internal_ip"))
    }

    /// Writes `file` into the container, creating its parent directory and
    /// applying its mode.
    async fn copy_to_container(&self, id: &ContainerId, file: &FileCopy) -> Result<()> {
        let _ = (id, file);
        Err(TestbedError::unsupported(self.name(), "copy_to_container"))
    }

    /// Snapshots the container into a new image.
    async fn commit(&self, id: &ContainerId, image: &str) -> Result<()> {
        let _ = (id, image);
        Err(TestbedError::unsupported(self.name(), "commit"))
    }

    /// Follows the container output.
    ///
    /// The default implementation re-reads [`Backend::container_logs`] and
    /// yields lines it has not seen yet.
    fn stream_logs(self: Arc<Self>, id: ContainerId) -> LogStream {
        poll_log_stream(self, id, Duration::from_millis(250))
    }
}

/// Polls `container_logs` until `substring` appears or `timeout` elapses.
///
/// Returns after no less than `timeout` when the line never shows up, with a
/// [`TestbedError::WaitTimeout`] carrying the elapsed time and output tail.
/// A vanished container aborts the wait early.
pub async fn wait_for_log_by_polling<B: Backend + ?Sized>(
    backend: &B,
    id: &ContainerId,
    substring: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts: u32 = 0;
    let mut last_output = String::new();

    loop {
        attempts += 1;
        match backend.container_logs(id).await {
            Ok(logs) => {
                if logs.contains(substring) {
                    debug!(container = %id, attempts, "found log line {:?}", substring);
                    return Ok(());
                }
                last_output = logs;
            }
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => debug!(container = %id, "log read failed while waiting: {}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TestbedError::WaitTimeout {
                condition: format!("log line {:?} (checked {} times)", substring, attempts),
                elapsed: now - start,
                recent_output: testbed_shared_types::tail_lines(&last_output, DIAGNOSTIC_TAIL_LINES),
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

struct PollState<B: ?Sized> {
    backend: Arc<B>,
    id: ContainerId,
    /// Bytes of the log already emitted, always ending on a newline.
    consumed: usize,
    /// Unterminated tail of the last read, flushed when the stream ends.
    partial: String,
    pending: VecDeque<String>,
    done: bool,
}

impl<B: ?Sized> PollState<B> {
    /// Queue every complete line of `logs` past `consumed`.
    fn absorb(&mut self, logs: &str) {
        let Some(fresh) = logs.get(self.consumed..) else {
            return;
        };
        match fresh.rfind('\n') {
            Some(end) => {
                self.pending
                    .extend(fresh[..end].split('\n').map(|l| l.trim_end_matches('\r').to_string()));
                self.consumed += end + 1;
                self.partial = fresh[end + 1..].to_string();
            }
            None => self.partial = fresh.to_string(),
        }
    }
}

/// Builds a [`LogStream`] by re-reading the full log every `interval`.
///
/// Only newline-terminated lines are emitted while the container is alive; a
/// trailing partial line is held back until it completes or the log ends.
pub fn poll_log_stream<B: Backend + ?Sized>(
    backend: Arc<B>,
    id: ContainerId,
    interval: Duration,
) -> LogStream {
    let state = PollState {
        backend,
        id,
        consumed: 0,
        partial: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(line) = st.pending.pop_front() {
                return Some((line, st));
            }
            if st.done {
                return None;
            }
            match st.backend.container_logs(&st.id).await {
                Ok(logs) => {
                    st.absorb(&logs);
                    if !st.pending.is_empty() {
                        continue;
                    }
                }
                Err(e) => {
                    debug!(container = %st.id, "log stream ended: {}", e);
                    st.done = true;
                    if !st.partial.is_empty() {
                        let rest = std::mem::take(&mut st.partial);
                        st.pending.push_back(rest);
                    }
                    continue;
                }
            }
            tokio::time::sleep(interval).await;
        }
    })
    .boxed()
}
