//! The transport lifecycle state machine.

use crate::status::Status;

/// The states of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not started yet.
    NotStarted,
    /// Connection setup in progress.
    Setup,
    /// The transport carries calls.
    Ready,
    /// Shut down; no new calls are accepted but existing calls may continue.
    Shutdown,
    /// Fully terminated (or failed to start). Nothing can be sent or
    /// received. Terminal.
    ShutdownTerminated,
}

fn transition_allowed(current: TransportState, next: TransportState) -> bool {
    use TransportState::*;
    match next {
        NotStarted => false,
        Setup => current == NotStarted,
        Ready => matches!(current, NotStarted | Setup),
        Shutdown => matches!(current, NotStarted | Setup | Ready),
        ShutdownTerminated => current == Shutdown,
    }
}

/// Lifecycle state plus the canonical shutdown status, guarded by the
/// transport lock.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: TransportState,
    shutdown_status: Option<Status>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: TransportState::NotStarted,
            shutdown_status: None,
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state
    }

    pub(crate) fn in_state(&self, state: TransportState) -> bool {
        self.state == state
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(
            self.state,
            TransportState::Shutdown | TransportState::ShutdownTerminated
        )
    }

    /// Move to `next`. Any transition outside the legal set is a programming
    /// error and panics.
    pub(crate) fn transition_to(&mut self, next: TransportState) {
        assert!(
            transition_allowed(self.state, next),
            "illegal transport state transition: {:?} -> {next:?}",
            self.state,
        );
        self.state = next;
    }

    /// Record the shutdown status. The first status wins; later shutdowns do
    /// not overwrite it.
    pub(crate) fn record_shutdown_status(&mut self, status: Status) {
        if self.shutdown_status.is_none() {
            self.shutdown_status = Some(status);
        }
    }

    pub(crate) fn shutdown_status(&self) -> Option<&Status> {
        self.shutdown_status.as_ref()
    }
}
