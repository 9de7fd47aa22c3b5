//! A scope whose cleanup never runs.
//!
//! Containers started from the command line must outlive the process that
//! created them; `testbed stop` removes them explicitly.

use std::sync::Arc;

use testbed_core::{CleanupAction, LogSink, Scope};
use tracing::{debug, info};

pub struct DetachedScope {
    name: String,
}

impl DetachedScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Scope for DetachedScope {
    fn name(&self) -> &str {
        &self.name
    }

    fn failed(&self) -> bool {
        false
    }

    fn log(&self, line: &str) {
        info!(container = %self.name, "{}", line);
    }

    fn on_exit(&self, _action: CleanupAction) {
        debug!(container = %self.name, "Dropping cleanup action, container stays until stopped");
    }

    fn log_sink(&self) -> LogSink {
        let name = self.name.clone();
        Arc::new(move |line: &str| info!(container = %name, "{}", line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_core::ScopeExt;

    #[tokio::test]
    async fn test_cleanup_actions_are_dropped() {
        let scope = DetachedScope::new("cache");
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        scope.defer(move |_| async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(scope.name(), "cache");
        assert!(!scope.failed());
    }
}
