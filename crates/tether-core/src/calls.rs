//! The call table: concurrent mapping from call id to inbound handler, plus
//! the client-side call-id allocator.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use tether_channel::Parcel;

use crate::status::Status;
use crate::wire::{FIRST_CALL_ID, LAST_CALL_ID};

/// The per-call collaborator consuming inbound stream transactions.
///
/// Implementations synchronize on their own per-call lock; the transport
/// never invokes them while holding the transport lock.
pub trait InboundHandler: Send + Sync {
    /// Deliver one inbound stream transaction for this call.
    fn handle_transaction(&self, parcel: Parcel);

    /// The transmit window reopened; sends stalled on readiness may resume.
    fn on_transport_ready(&self);

    /// Abnormally close the call with the given status. Invoked at most once
    /// by the transport, when it terminates.
    fn close_abnormal(&self, status: Status);
}

/// Thread-safe call-id → inbound mapping.
///
/// `put_if_absent` lets the dispatcher and the client stream-creation path
/// race without double-creating a handler for the same id.
#[derive(Default)]
pub struct CallTable {
    calls: DashMap<u32, Arc<dyn InboundHandler>>,
    next_call_id: AtomicU32,
}

impl CallTable {
    /// Empty table; the allocator starts at [`FIRST_CALL_ID`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_call_id: AtomicU32::new(FIRST_CALL_ID),
        }
    }

    /// Look up the inbound for a call id.
    #[must_use]
    pub fn get(&self, call_id: u32) -> Option<Arc<dyn InboundHandler>> {
        self.calls.get(&call_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert unless present; returns the existing inbound if there was one.
    pub fn put_if_absent(
        &self,
        call_id: u32,
        inbound: Arc<dyn InboundHandler>,
    ) -> Option<Arc<dyn InboundHandler>> {
        match self.calls.entry(call_id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(inbound);
                None
            }
        }
    }

    /// Remove a call. Returns whether it was present.
    pub fn remove(&self, call_id: u32) -> bool {
        self.calls.remove(&call_id).is_some()
    }

    /// Snapshot every inbound and clear the table.
    pub fn snapshot_and_clear(&self) -> Vec<Arc<dyn InboundHandler>> {
        let snapshot: Vec<_> = self
            .calls
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.calls.clear();
        snapshot
    }

    /// Snapshot every inbound without clearing.
    pub fn snapshot(&self) -> Vec<Arc<dyn InboundHandler>> {
        self.calls
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Whether the table holds no calls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Number of in-flight calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    pub(crate) fn set_next_call_id(&self, id: u32) {
        self.next_call_id.store(id, Ordering::SeqCst);
    }

    /// Allocate the next client-side call id, monotonically, wrapping back to
    /// [`FIRST_CALL_ID`] when [`LAST_CALL_ID`] is reached. Collisions with
    /// in-flight ids are left to `put_if_absent` to detect.
    pub fn allocate_call_id(&self) -> u32 {
        loop {
            let current = self.next_call_id.load(Ordering::SeqCst);
            let mut next = current + 1;
            if next == LAST_CALL_ID {
                next = FIRST_CALL_ID;
            }
            if self
                .next_call_id
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return current;
            }
        }
    }
}
