//! The transport core: a symmetric peer multiplexing many concurrent calls
//! over one duplex pair of message channels.
//!
//! # Locking
//!
//! Transactions arrive here and are passed on to per-call handlers, while
//! calls reach back in to send; acquiring the two lock scopes in both orders
//! would deadlock. The rule is strict: the transport lock is never held while
//! a per-call lock is taken. Control dispatch, lifecycle, attributes, the
//! sender reference, and the acked flow counters live under the transport
//! lock; everything that touches a call (closing at termination, readiness
//! wake-ups, the unregister-triggered shutdown check) is deferred through a
//! [`TaskRunner`] so the transport lock is released first. State consulted by
//! stream code under its own call lock (`is_ready`) is a bare atomic.
//!
//! # Dispatch
//!
//! ```text
//! inbound transaction
//!     ├── code < FIRST_CALL_ID: control, under the transport lock
//!     │       setup / shutdown / ack / ping / ping-response
//!     └── code ≥ FIRST_CALL_ID: stream, lock-free call-table lookup,
//!             delivered to the call without the transport lock
//! ```

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use tether_channel::{
    DeathLink, DeathRecipient, Endpoint, Parcel, Receiver, TransactionHandler, Uid,
};

use crate::attrs::TransportAttrs;
use crate::calls::{CallTable, InboundHandler};
use crate::flow::FlowController;
use crate::fsm::{Lifecycle, TransportState};
use crate::runner::TaskRunner;
use crate::status::{status_from_channel_error, Status};
use crate::wire::{self, SetupFrame};

/// State guarded by the transport lock.
pub(crate) struct Guarded {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) attrs: TransportAttrs,
    pub(crate) death_link: Option<DeathLink>,
}

/// Role-specific behavior the core calls back into. Implemented by the
/// client and server transports; invoked with the transport lock held unless
/// noted otherwise.
pub(crate) trait RoleHooks: Send + Sync {
    /// The transport moved to `Shutdown` with the given (first) status.
    fn notify_shutdown(&self, status: &Status);

    /// The transport finished terminating. Invoked off the transport lock,
    /// after every snapshotted call was closed.
    fn notify_terminated(&self);

    /// A stream transaction arrived for an unknown call id. The server
    /// creates a fresh inbound; the client returns `None` (it only ever
    /// receives for ids it allocated).
    fn create_inbound(
        &self,
        guarded: &mut Guarded,
        call_id: u32,
    ) -> Option<Arc<dyn InboundHandler>>;

    /// An inbound `SETUP_TRANSPORT` transaction.
    fn handle_setup_transport(&self, guarded: &mut Guarded, parcel: Parcel);

    /// An inbound `PING_RESPONSE` transaction.
    fn handle_ping_response(&self, guarded: &mut Guarded, parcel: Parcel);
}

/// Shared state and behavior of both transport roles.
pub(crate) struct TransportCore {
    self_weak: Weak<TransportCore>,
    hooks: Weak<dyn RoleHooks>,
    watcher: Weak<dyn DeathRecipient>,
    receiver: Receiver,
    calls: CallTable,
    flow: FlowController,
    guarded: Mutex<Guarded>,
    /// The peer's sender reference. Written only under the transport lock;
    /// read lock-free on the stream send path.
    outgoing: RwLock<Option<Endpoint>>,
    deferred: Arc<dyn TaskRunner>,
}

impl TransportCore {
    pub(crate) fn new(
        local_uid: Uid,
        handler: Weak<dyn TransactionHandler>,
        hooks: Weak<dyn RoleHooks>,
        watcher: Weak<dyn DeathRecipient>,
        attrs: TransportAttrs,
        deferred: Arc<dyn TaskRunner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| TransportCore {
            self_weak: self_weak.clone(),
            hooks,
            watcher,
            receiver: Receiver::new(local_uid, handler),
            calls: CallTable::new(),
            flow: FlowController::new(),
            guarded: Mutex::new(Guarded {
                lifecycle: Lifecycle::new(),
                attrs,
                death_link: None,
            }),
            outgoing: RwLock::new(None),
            deferred,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock()
    }

    pub(crate) fn calls(&self) -> &CallTable {
        &self.calls
    }

    /// Whether the transport can accept stream sends right now.
    /// Intentionally unsynchronized: called while per-call locks are held.
    pub(crate) fn is_ready(&self) -> bool {
        self.flow.is_ready()
    }

    pub(crate) fn state(&self) -> TransportState {
        self.guarded.lock().lifecycle.state()
    }

    pub(crate) fn attributes(&self) -> TransportAttrs {
        self.guarded.lock().attrs.clone()
    }

    fn hooks(&self) -> Option<Arc<dyn RoleHooks>> {
        self.hooks.upgrade()
    }

    fn outgoing_endpoint(&self) -> Option<Endpoint> {
        self.outgoing.read().clone()
    }

    /// Single entry point for inbound transactions.
    pub(crate) fn handle_transaction(&self, code: u32, mut parcel: Parcel) -> bool {
        if code < wire::FIRST_CALL_ID {
            let Some(hooks) = self.hooks() else {
                return false;
            };
            let mut guarded = self.guarded.lock();
            match code {
                wire::ACKNOWLEDGE_BYTES => {
                    if let Some(total) = wire::decode_acknowledge_bytes(&mut parcel) {
                        self.handle_acknowledged_bytes(&mut guarded, total);
                    }
                }
                wire::SHUTDOWN_TRANSPORT => self.shutdown_internal(
                    &mut guarded,
                    Status::unavailable("transport shutdown by peer"),
                    true,
                ),
                wire::SETUP_TRANSPORT => hooks.handle_setup_transport(&mut guarded, parcel),
                wire::PING => self.handle_ping(&mut guarded, parcel),
                wire::PING_RESPONSE => hooks.handle_ping_response(&mut guarded, parcel),
                _ => return false,
            }
            true
        } else {
            let size = parcel.data_size() as u64;
            let mut inbound = self.calls.get(code);
            if inbound.is_none() {
                let mut guarded = self.guarded.lock();
                if !guarded.lifecycle.is_shutdown() {
                    if let Some(hooks) = self.hooks() {
                        if let Some(created) = hooks.create_inbound(&mut guarded, code) {
                            // The dispatcher and stream creation can race to
                            // register the same id; the first insert wins.
                            inbound =
                                Some(match self.calls.put_if_absent(code, Arc::clone(&created)) {
                                    Some(existing) => existing,
                                    None => created,
                                });
                        }
                    }
                }
            }
            if let Some(inbound) = inbound {
                inbound.handle_transaction(parcel);
            }
            if self.flow.record_received(size) {
                let mut guarded = self.guarded.lock();
                self.send_acknowledge_bytes(&mut guarded);
            }
            true
        }
    }

    fn handle_ping(&self, guarded: &mut Guarded, mut parcel: Parcel) {
        if !guarded.lifecycle.in_state(TransportState::Ready) {
            return;
        }
        let Some(id) = wire::decode_ping_id(&mut parcel) else {
            return;
        };
        if let Some(outgoing) = self.outgoing_endpoint() {
            if let Err(error) = outgoing.transact(wire::PING_RESPONSE, wire::encode_ping_id(id)) {
                tracing::debug!("failed to reflect ping {id}: {error}");
            }
        }
    }

    /// The peer acknowledged reception of stream bytes. If that reopened a
    /// full transmit window, wake every in-flight call. Waking takes each
    /// call's own lock, so it runs off the transport lock.
    pub(crate) fn handle_acknowledged_bytes(&self, _guarded: &mut Guarded, peer_reported: u64) {
        if self.flow.on_peer_ack(peer_reported) {
            let calls = self.calls.snapshot();
            tracing::debug!("transmit window no longer full; waking {} calls", calls.len());
            self.deferred.execute(Box::new(move || {
                for inbound in calls {
                    inbound.on_transport_ready();
                }
            }));
        }
    }

    /// Acknowledge everything received so far. A failed emission is a setup
    /// for silent deadlock (the peer's window would never reopen), so it
    /// shuts the transport down.
    pub(crate) fn send_acknowledge_bytes(&self, guarded: &mut Guarded) {
        let Some(outgoing) = self.outgoing_endpoint() else {
            tracing::debug!("no outgoing endpoint to acknowledge bytes to");
            return;
        };
        let total = self.flow.emit_ack();
        match outgoing.transact(wire::ACKNOWLEDGE_BYTES, wire::encode_acknowledge_bytes(total)) {
            Ok(true) => {}
            Ok(false) => self.shutdown_internal(
                guarded,
                Status::unavailable("Failed sending ack bytes transaction"),
                true,
            ),
            Err(error) => {
                let status = status_from_channel_error(&error);
                self.shutdown_internal(guarded, status, true);
            }
        }
    }

    /// Emit `SETUP_TRANSPORT` carrying our wire version and receiver to
    /// `target`. Failure shuts the transport down.
    pub(crate) fn send_setup_transaction(&self, guarded: &mut Guarded, target: &Endpoint) {
        let parcel = SetupFrame::encode(self.receiver.as_endpoint());
        match target.transact(wire::SETUP_TRANSPORT, parcel) {
            Ok(true) => {}
            Ok(false) => self.shutdown_internal(
                guarded,
                Status::unavailable("Failed sending SETUP_TRANSPORT transaction"),
                true,
            ),
            Err(error) => {
                let status = status_from_channel_error(&error);
                self.shutdown_internal(guarded, status, true);
            }
        }
    }

    /// Emit `SETUP_TRANSPORT` to the already-installed peer endpoint.
    pub(crate) fn send_setup_transaction_to_outgoing(&self, guarded: &mut Guarded) {
        match self.outgoing_endpoint() {
            Some(outgoing) => self.send_setup_transaction(guarded, &outgoing),
            None => self.shutdown_internal(
                guarded,
                Status::unavailable("No outgoing endpoint for SETUP_TRANSPORT"),
                true,
            ),
        }
    }

    /// Install the peer's sender reference and start watching for its death.
    /// Returns false if the peer is already dead.
    pub(crate) fn set_outgoing(&self, guarded: &mut Guarded, endpoint: Endpoint) -> bool {
        *self.outgoing.write() = Some(Arc::clone(&endpoint));
        match endpoint.link_to_death(self.watcher.clone()) {
            Ok(link) => {
                guarded.death_link = Some(link);
                true
            }
            Err(_) => false,
        }
    }

    /// The single funnel into `Shutdown` and `ShutdownTerminated`.
    ///
    /// The first status wins and is the one surfaced everywhere. Termination
    /// detaches the receiver, notifies the peer best-effort, then closes the
    /// snapshotted calls and notifies the role, deferred: closing a call
    /// takes the call's own lock.
    pub(crate) fn shutdown_internal(
        &self,
        guarded: &mut Guarded,
        status: Status,
        force_terminate: bool,
    ) {
        if !guarded.lifecycle.is_shutdown() {
            guarded.lifecycle.record_shutdown_status(status.clone());
            guarded.lifecycle.transition_to(TransportState::Shutdown);
            tracing::debug!("transport shutdown: {status}");
            if let Some(hooks) = self.hooks() {
                hooks.notify_shutdown(&status);
            }
        }
        if !guarded.lifecycle.in_state(TransportState::ShutdownTerminated)
            && (force_terminate || self.calls.is_empty())
        {
            self.receiver.detach();
            guarded.lifecycle.transition_to(TransportState::ShutdownTerminated);
            self.send_shutdown_transaction(guarded);
            let closed = self.calls.snapshot_and_clear();
            let final_status = guarded
                .lifecycle
                .shutdown_status()
                .cloned()
                .unwrap_or_else(Status::ok);
            let hooks = self.hooks.clone();
            tracing::debug!("transport terminated; closing {} calls", closed.len());
            self.deferred.execute(Box::new(move || {
                for inbound in closed {
                    inbound.close_abnormal(final_status.clone());
                }
                if let Some(hooks) = hooks.upgrade() {
                    hooks.notify_terminated();
                }
            }));
        }
    }

    /// Best-effort `SHUTDOWN_TRANSPORT` to the peer. Unlinks the death
    /// watcher first; errors are ignored, the transport is gone either way.
    fn send_shutdown_transaction(&self, guarded: &mut Guarded) {
        guarded.death_link = None;
        if let Some(outgoing) = self.outgoing_endpoint() {
            if let Err(error) = outgoing.transact(wire::SHUTDOWN_TRANSPORT, Parcel::new()) {
                tracing::debug!("failed to send shutdown notification: {error}");
            }
        }
    }

    /// The peer process died.
    pub(crate) fn on_peer_died(&self) {
        let mut guarded = self.guarded.lock();
        self.shutdown_internal(&mut guarded, Status::unavailable("peer died"), true);
    }

    /// Emit a `PING` with the given id.
    pub(crate) fn send_ping(&self, id: u32) -> Result<(), Status> {
        let guarded = self.guarded.lock();
        if guarded
            .lifecycle
            .in_state(TransportState::ShutdownTerminated)
        {
            return Err(guarded
                .lifecycle
                .shutdown_status()
                .cloned()
                .unwrap_or_else(|| Status::unavailable("transport is terminated")));
        }
        let Some(outgoing) = self.outgoing_endpoint() else {
            return Err(Status::failed_precondition("Transport not ready."));
        };
        match outgoing.transact(wire::PING, wire::encode_ping_id(id)) {
            Ok(_) => Ok(()),
            Err(error) => Err(status_from_channel_error(&error)),
        }
    }

    /// Emit a stream transaction for `call_id`. Called by the outbound side
    /// of a call with no transport lock held (the caller holds the per-call
    /// lock). Failures are returned to the caller; they do not shut the
    /// transport down (peer death arrives through the death watcher).
    pub(crate) fn send_stream(&self, call_id: u32, parcel: Parcel) -> Result<(), Status> {
        let size = parcel.data_size() as u64;
        let Some(outgoing) = self.outgoing_endpoint() else {
            return Err(Status::failed_precondition("transport not ready"));
        };
        match outgoing.transact(call_id, parcel) {
            Ok(true) => {}
            Ok(false) => return Err(Status::unavailable("Failed sending transaction")),
            Err(error) => return Err(status_from_channel_error(&error)),
        }
        let total = self.flow.record_sent(size);
        if !self.flow.is_ready() {
            tracing::debug!(
                "transmit window full: outgoing={total} acked={}",
                self.flow.bytes_sent_acked()
            );
        }
        Ok(())
    }

    /// Close a call abnormally on the wire, bypassing in-band framing. The
    /// call is being torn down regardless, so emission failures are only
    /// logged.
    pub(crate) fn send_out_of_band_close(&self, call_id: u32, status: &Status) {
        if let Err(error) = self.send_stream(call_id, wire::encode_out_of_band_close(status)) {
            tracing::warn!("Failed sending oob close transaction: {error}");
        }
    }

    /// Remove a call from the table. When the last call leaves a transport
    /// already in `Shutdown`, termination is finished off this stack: the
    /// caller holds its per-call lock and finishing takes the transport
    /// lock.
    pub(crate) fn unregister_call(&self, call_id: u32) -> bool {
        let removed = self.calls.remove(call_id);
        if removed && self.calls.is_empty() {
            if let Some(core) = self.self_weak.upgrade() {
                self.deferred.execute(Box::new(move || {
                    let mut guarded = core.guarded.lock();
                    if guarded.lifecycle.in_state(TransportState::Shutdown) {
                        let status = guarded
                            .lifecycle
                            .shutdown_status()
                            .cloned()
                            .unwrap_or_else(Status::ok);
                        core.shutdown_internal(&mut guarded, status, true);
                    }
                }));
            }
        }
        removed
    }
}
