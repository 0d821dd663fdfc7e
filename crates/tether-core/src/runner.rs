//! Task runners: where the transport puts work it must not do under a lock.
//!
//! Call closes at termination, readiness wake-ups, unregister-triggered
//! shutdown checks, and blocking security-policy evaluation all run through a
//! [`TaskRunner`] so the transport lock is released before any per-call lock
//! is taken.

use std::sync::Arc;

/// Executes tasks away from the caller's stack.
pub trait TaskRunner: Send + Sync {
    /// Run `task` at some point, off the current stack. Implementations must
    /// tolerate tasks that block.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs tasks on a tokio runtime's blocking pool.
pub struct TokioRunner {
    handle: tokio::runtime::Handle,
}

impl TokioRunner {
    /// Use the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskRunner for TokioRunner {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(task);
    }
}

/// Runs every task on its own thread. Heavyweight but dependency-free;
/// suitable for tests and small deployments.
#[derive(Default)]
pub struct ThreadRunner;

impl ThreadRunner {
    /// Shared thread runner.
    #[must_use]
    pub fn shared() -> Arc<dyn TaskRunner> {
        Arc::new(ThreadRunner)
    }
}

impl TaskRunner for ThreadRunner {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(task);
    }
}
