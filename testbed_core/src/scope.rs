//! Test scopes and cleanup registration.
//!
//! Every resource the harness acquires (a container, a database) registers a
//! release action with the [`Scope`] it was acquired for. Actions run in
//! reverse registration order when the scope finishes, exactly once.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// How the scope ended, handed to every cleanup action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeExit {
    pub failed: bool,
}

pub type CleanupAction = Box<dyn FnOnce(ScopeExit) -> BoxFuture<'static, ()> + Send>;

/// Destination for diagnostic lines produced on behalf of a scope.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// The on-exit capability the harness needs from a test framework.
pub trait Scope: Send + Sync {
    /// Hierarchical name, parent and child joined by `/`.
    fn name(&self) -> &str;

    fn failed(&self) -> bool;

    /// Surface a diagnostic line in the test's output.
    fn log(&self, line: &str);

    /// Register an action to run when the scope ends.
    fn on_exit(&self, action: CleanupAction);

    /// An owned sink for background tasks that outlive the borrow of `self`.
    fn log_sink(&self) -> LogSink;
}

/// Convenience for registering async closures as cleanup actions.
pub trait ScopeExt: Scope {
    fn defer<F, Fut>(&self, action: F)
    where
        F: FnOnce(ScopeExit) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_exit(Box::new(move |exit| action(exit).boxed()));
    }
}

impl<S: Scope + ?Sized> ScopeExt for S {}

struct ScopeInner {
    name: String,
    parent: Option<Arc<ScopeInner>>,
    failed: AtomicBool,
    finished: AtomicBool,
    actions: Mutex<Vec<CleanupAction>>,
    logs: Mutex<Vec<String>>,
}

impl ScopeInner {
    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        if let Some(parent) = &self.parent {
            parent.mark_failed();
        }
    }

    fn record(&self, line: &str) {
        info!(test = %self.name, "{}", line);
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(line.to_string());
        }
    }

    fn take_actions(&self) -> Vec<CleanupAction> {
        match self.actions.lock() {
            Ok(mut actions) => std::mem::take(&mut *actions),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let actions = self.take_actions();
        if actions.is_empty() {
            return;
        }
        let exit = ScopeExit {
            failed: self.failed.load(Ordering::SeqCst),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(test = %self.name, count = actions.len(), "Scope dropped unfinished, running cleanup in background");
                handle.spawn(run_actions(actions, exit));
            }
            Err(_) => {
                warn!(
                    test = %self.name,
                    count = actions.len(),
                    "Scope dropped outside a runtime, cleanup actions skipped"
                );
            }
        }
    }
}

async fn run_actions(actions: Vec<CleanupAction>, exit: ScopeExit) {
    for action in actions.into_iter().rev() {
        action(exit).await;
    }
}

/// Standalone [`Scope`] implementation.
///
/// Clones share state. Call [`TestScope::finish`] at the end of the test (or
/// use [`run_test`]); a scope dropped without finishing hands its cleanup to
/// the current tokio runtime.
#[derive(Clone)]
pub struct TestScope {
    inner: Arc<ScopeInner>,
}

impl TestScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parent(name.into(), None)
    }

    fn with_parent(name: String, parent: Option<Arc<ScopeInner>>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name,
                parent,
                failed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                actions: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A nested scope named `<parent>/<name>`. Its failure fails the parent.
    pub fn child(&self, name: &str) -> TestScope {
        let name = format!("{}/{}", self.inner.name, name);
        Self::with_parent(name, Some(self.inner.clone()))
    }

    /// Mark the scope (and its ancestors) failed.
    pub fn fail(&self) {
        self.inner.mark_failed();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Lines passed to [`Scope::log`] so far.
    pub fn logs(&self) -> Vec<String> {
        self.inner
            .logs
            .lock()
            .map(|logs| logs.clone())
            .unwrap_or_default()
    }

    pub fn pending_actions(&self) -> usize {
        self.inner.actions.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Run every registered action, most recent first. Later calls are no-ops.
    pub async fn finish(&self) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let actions = self.inner.take_actions();
        debug!(test = %self.inner.name, count = actions.len(), "Running scope cleanup");
        run_actions(
            actions,
            ScopeExit {
                failed: Scope::failed(self),
            },
        )
        .await;
    }
}

impl Scope for TestScope {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    fn log(&self, line: &str) {
        self.inner.record(line);
    }

    fn on_exit(&self, action: CleanupAction) {
        if self.is_finished() {
            // Late registration: run on its own rather than leak the resource.
            warn!(test = %self.inner.name, "Cleanup registered after scope finished");
            let exit = ScopeExit {
                failed: Scope::failed(self),
            };
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(action(exit));
            }
            return;
        }
        match self.inner.actions.lock() {
            Ok(mut actions) => actions.push(action),
            Err(poisoned) => poisoned.into_inner().push(action),
        }
    }

    fn log_sink(&self) -> LogSink {
        // Weak: sinks end up inside the scope's own cleanup actions.
        let inner = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        Arc::new(move |line: &str| match inner.upgrade() {
            Some(inner) => inner.record(line),
            None => info!(test = %name, "{}", line),
        })
    }
}

impl std::fmt::Debug for TestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestScope")
            .field("name", &self.inner.name)
            .field("failed", &self.inner.failed.load(Ordering::SeqCst))
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Run `body` inside `scope`, then run the scope's cleanup.
///
/// An `Err` or a panic marks the scope failed before cleanup runs; a panic is
/// resumed once cleanup has finished.
pub async fn run_test<F, Fut, T, E>(scope: TestScope, body: F) -> Result<T, E>
where
    F: FnOnce(TestScope) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let outcome = AssertUnwindSafe(body(scope.clone())).catch_unwind().await;
    match outcome {
        Ok(result) => {
            if result.is_err() {
                scope.fail();
            }
            scope.finish().await;
            result
        }
        Err(panic) => {
            scope.fail();
            scope.finish().await;
            std::panic::resume_unwind(panic)
        }
    }
}
