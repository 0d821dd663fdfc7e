//! The server transport role.
//!
//! A server transport is created by the binding front door once a client's
//! `SETUP_TRANSPORT` reaches it, with the client's sender reference and the
//! attributes (including the kernel-reported peer uid) already in hand. Call
//! ids are assigned by the peer; the server creates each call's inbound on
//! first receipt, through the factory it was constructed with.

use std::sync::{Arc, OnceLock, Weak};

use tether_channel::{DeathRecipient, Endpoint, Parcel, TransactionHandler, Uid};

use crate::attrs::TransportAttrs;
use crate::calls::InboundHandler;
use crate::fsm::TransportState;
use crate::runner::TaskRunner;
use crate::status::Status;
use crate::transport::{Guarded, RoleHooks, TransportCore};
use crate::Metadata;

/// Receives lifecycle and stream notifications from a server transport.
pub trait ServerTransportListener: Send + Sync {
    /// The transport is ready; the listener may decorate the attributes.
    fn transport_ready(&self, attrs: TransportAttrs) -> TransportAttrs;
    /// The framing layer announced a new stream.
    fn stream_created(&self, stream: Arc<dyn InboundHandler>, method_name: &str, headers: Metadata);
    /// The transport finished terminating.
    fn transport_terminated(&self);
}

/// Creates the inbound handler for a peer-assigned call id. Invoked with the
/// transport lock held; implementations must only construct, not call back
/// into the transport.
pub type ServerInboundFactory =
    Box<dyn Fn(ServerCall) -> Arc<dyn InboundHandler> + Send + Sync>;

/// Construction parameters for a server transport.
#[derive(Debug, Clone)]
pub struct ServerTransportOptions {
    /// Uid of our own process.
    pub local_uid: Uid,
    /// Attributes populated by the binding front door (peer uid included).
    pub attrs: TransportAttrs,
}

/// Server side of a transport.
pub struct ServerTransport {
    core: Arc<TransportCore>,
    inbound_factory: ServerInboundFactory,
    listener: OnceLock<Arc<dyn ServerTransportListener>>,
    self_weak: Weak<ServerTransport>,
}

impl ServerTransport {
    /// Create a server transport over the peer's sender reference.
    pub fn new(
        options: ServerTransportOptions,
        peer: Endpoint,
        inbound_factory: ServerInboundFactory,
        deferred: Arc<dyn TaskRunner>,
    ) -> Arc<Self> {
        let transport = Arc::new_cyclic(|weak: &Weak<ServerTransport>| {
            let handler: Weak<dyn TransactionHandler> = weak.clone();
            let hooks: Weak<dyn RoleHooks> = weak.clone();
            let watcher: Weak<dyn DeathRecipient> = weak.clone();
            ServerTransport {
                core: TransportCore::new(
                    options.local_uid,
                    handler,
                    hooks,
                    watcher,
                    options.attrs,
                    deferred,
                ),
                inbound_factory,
                listener: OnceLock::new(),
                self_weak: weak.clone(),
            }
        });
        {
            let mut guarded = transport.core.lock();
            if !transport.core.set_outgoing(&mut guarded, peer) {
                // Peer already dead; the setup send in `set_listener` will
                // fail and shut us down.
                tracing::warn!("could not observe peer endpoint at construction");
            }
        }
        transport
    }

    /// Install the listener and bring the transport up: emit our half of the
    /// setup handshake and hand the listener the completed attributes. If the
    /// transport was already shut down, go straight to terminated.
    pub fn set_listener(&self, listener: Arc<dyn ServerTransportListener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!("server transport listener set twice");
            return;
        }
        let mut guarded = self.core.lock();
        if guarded.lifecycle.is_shutdown() {
            if guarded.lifecycle.in_state(TransportState::Shutdown) {
                guarded.lifecycle.transition_to(TransportState::ShutdownTerminated);
            }
            if let Some(listener) = self.listener.get() {
                listener.transport_terminated();
            }
        } else {
            self.core.send_setup_transaction_to_outgoing(&mut guarded);
            // The setup send can fail and shut us down; only then go ready.
            if !guarded.lifecycle.is_shutdown() {
                guarded.lifecycle.transition_to(TransportState::Ready);
                if let Some(listener) = self.listener.get() {
                    guarded.attrs = listener.transport_ready(guarded.attrs.clone());
                }
            }
        }
    }

    /// Announce a stream the framing layer created for a peer-assigned call.
    pub fn start_stream(
        &self,
        stream: Arc<dyn InboundHandler>,
        method_name: &str,
        headers: Metadata,
    ) -> Status {
        let guarded = self.core.lock();
        if guarded.lifecycle.is_shutdown() {
            return Status::unavailable("transport is shutdown");
        }
        if let Some(listener) = self.listener.get() {
            listener.stream_created(stream, method_name, headers);
        }
        Status::ok()
    }

    /// Graceful shutdown: refuse new calls, terminate once in-flight calls
    /// drain.
    pub fn shutdown(&self) {
        let mut guarded = self.core.lock();
        self.core.shutdown_internal(&mut guarded, Status::ok(), false);
    }

    /// Immediate shutdown: terminate now, closing in-flight calls.
    pub fn shutdown_now(&self, reason: Status) {
        let mut guarded = self.core.lock();
        self.core.shutdown_internal(&mut guarded, reason, true);
    }

    /// Whether the transport can accept stream sends right now.
    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.core.state()
    }

    /// The transport's attribute set.
    pub fn attributes(&self) -> TransportAttrs {
        self.core.attributes()
    }

    /// Number of in-flight calls.
    pub fn active_calls(&self) -> usize {
        self.core.calls().len()
    }
}

impl RoleHooks for ServerTransport {
    fn notify_shutdown(&self, _status: &Status) {
        // Nothing to do; the listener learns of termination only.
    }

    fn notify_terminated(&self) {
        if let Some(listener) = self.listener.get() {
            listener.transport_terminated();
        }
    }

    fn create_inbound(
        &self,
        _guarded: &mut Guarded,
        call_id: u32,
    ) -> Option<Arc<dyn InboundHandler>> {
        let call = ServerCall {
            transport: self.self_weak.clone(),
            call_id,
        };
        Some((self.inbound_factory)(call))
    }

    fn handle_setup_transport(&self, _guarded: &mut Guarded, _parcel: Parcel) {
        // The front door consumed the client's setup before this transport
        // existed; a second setup on a live transport is ignored.
    }

    fn handle_ping_response(&self, _guarded: &mut Guarded, _parcel: Parcel) {
        // Servers do not originate pings.
    }
}

impl TransactionHandler for ServerTransport {
    fn handle_transaction(&self, code: u32, parcel: Parcel) -> bool {
        self.core.handle_transaction(code, parcel)
    }
}

impl DeathRecipient for ServerTransport {
    fn peer_died(&self) {
        self.core.on_peer_died();
    }
}

/// The outbound capability of one server call.
pub struct ServerCall {
    transport: Weak<ServerTransport>,
    call_id: u32,
}

impl ServerCall {
    /// The peer-assigned call id.
    #[must_use]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Whether the transport can accept stream sends right now. Safe to call
    /// under the per-call lock.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.transport
            .upgrade()
            .is_some_and(|t| t.core.is_ready())
    }

    /// Send one framed stream transaction.
    pub fn send(&self, parcel: Parcel) -> Result<(), Status> {
        match self.transport.upgrade() {
            Some(transport) => transport.core.send_stream(self.call_id, parcel),
            None => Err(Status::unavailable("transport released")),
        }
    }

    /// Close the call abnormally on the wire; best-effort.
    pub fn send_out_of_band_close(&self, status: &Status) {
        if let Some(transport) = self.transport.upgrade() {
            transport.core.send_out_of_band_close(self.call_id, status);
        }
    }

    /// Remove the call from the transport. The stream-facing side calls this
    /// exactly once, when the stream closes.
    pub fn unregister(&self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.core.unregister_call(self.call_id);
        }
    }
}
