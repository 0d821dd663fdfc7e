//! Liveness tracking: correlates outbound pings with their responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::runner::TaskRunner;
use crate::status::Status;

/// Invoked with the round-trip time on response, or the failure status.
pub type PingCallback = Box<dyn FnOnce(Result<Duration, Status>) + Send>;

struct PendingPing {
    callback: PingCallback,
    runner: Arc<dyn TaskRunner>,
    started: Instant,
}

/// Correlates outbound ping ids with responses and dispatches user callbacks
/// on their executors.
#[derive(Default)]
pub struct PingTracker {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingPing>>,
}

impl PingTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id, record the callback, and emit the ping through
    /// `send`. A send failure fails the callback immediately.
    pub fn start_ping(
        &self,
        send: impl FnOnce(u32) -> Result<(), Status>,
        callback: PingCallback,
        runner: Arc<dyn TaskRunner>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(
            id,
            PendingPing {
                callback,
                runner,
                started: Instant::now(),
            },
        );
        if let Err(status) = send(id) {
            if let Some(pending) = self.pending.lock().remove(&id) {
                dispatch(pending, Err(status));
            }
        }
    }

    /// Handle an inbound ping response. Unknown ids are ignored.
    pub fn on_ping_response(&self, id: u32) {
        let Some(pending) = self.pending.lock().remove(&id) else {
            tracing::debug!("ignoring ping response with unknown id {id}");
            return;
        };
        let rtt = pending.started.elapsed();
        dispatch(pending, Ok(rtt));
    }

    /// Number of pings awaiting a response.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

fn dispatch(pending: PendingPing, result: Result<Duration, Status>) {
    let callback = pending.callback;
    pending.runner.execute(Box::new(move || callback(result)));
}
