//! Background log streaming with line filtering.

use crate::scope::LogSink;
use container_backend_interface::Backend;
use futures_util::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use testbed_shared_types::{short_id, ContainerId};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Keep/drop predicate applied to each streamed line. Keeps everything by default.
#[derive(Clone)]
pub struct LogFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl LogFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    pub fn keep_all() -> Self {
        Self::new(|_| true)
    }

    /// Drop lines containing any of `patterns`.
    pub fn drop_matching<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        Self::new(move |line| !patterns.iter().any(|p| line.contains(p.as_str())))
    }

    pub fn keeps(&self, line: &str) -> bool {
        (self.0)(line)
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::keep_all()
    }
}

impl fmt::Debug for LogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogFilter(..)")
    }
}

/// A running log stream for one container.
///
/// The task ends on its own when the backend stream ends; [`LogStreamer::stop`]
/// and drop abort it.
#[derive(Debug)]
pub struct LogStreamer {
    task: Option<JoinHandle<()>>,
    kept: Arc<AtomicUsize>,
}

impl LogStreamer {
    /// Start forwarding kept lines to `sink`. Without a sink lines are only traced.
    pub fn spawn(
        backend: Arc<dyn Backend>,
        id: ContainerId,
        filter: LogFilter,
        sink: Option<LogSink>,
    ) -> Self {
        let kept = Arc::new(AtomicUsize::new(0));
        let counter = kept.clone();
        let task = tokio::spawn(async move {
            let prefix = short_id(&id).to_string();
            let mut stream = backend.stream_logs(id.clone());
            while let Some(line) = stream.next().await {
                if !filter.keeps(&line) {
                    continue;
                }
                counter.fetch_add(1, Ordering::Relaxed);
                match &sink {
                    Some(sink) => sink(&format!("[{prefix}] {line}")),
                    None => trace!(container_id = %prefix, "{}", line),
                }
            }
            debug!(container_id = %prefix, "Log stream ended");
        });
        Self {
            task: Some(task),
            kept,
        }
    }

    /// Lines that passed the filter so far.
    pub fn kept_lines(&self) -> usize {
        self.kept.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Abort the task and wait for it to go away.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for LogStreamer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
