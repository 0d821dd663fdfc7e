//! The client transport role.
//!
//! The client initiates the transport: it binds to the server's front door,
//! sends `SETUP_TRANSPORT` with its own receiver, and completes the handshake
//! when the server's setup arrives, authorizing the peer on a
//! blocking-capable runner, never under the transport lock. The client
//! allocates call ids, tracks which streams keep the transport "in use", and
//! owns the ping tracker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tether_channel::{
    calling_uid, DeathRecipient, Endpoint, Parcel, ServiceAddress, TransactionHandler, Uid,
};

use crate::attrs::{default_security_level, InboundParcelPolicy, SecurityLevel, TransportAttrs};
use crate::calls::InboundHandler;
use crate::fsm::TransportState;
use crate::ping::{PingCallback, PingTracker};
use crate::runner::TaskRunner;
use crate::status::Status;
use crate::transport::{Guarded, RoleHooks, TransportCore};
use crate::wire::{self, SetupFrame};

/// Receives lifecycle notifications from a client transport. All callbacks
/// except `transport_terminated` run under the transport lock; implementations
/// must not call back into the transport from them.
pub trait ManagedClientTransportListener: Send + Sync {
    /// The handshake completed; the transport accepts calls.
    fn transport_ready(&self);
    /// The transport began shutting down with the given status.
    fn transport_shutdown(&self, status: &Status);
    /// The transport finished terminating.
    fn transport_terminated(&self);
    /// The number of in-use streams crossed zero in either direction.
    fn transport_in_use(&self, in_use: bool);
}

/// Decides whether a peer process may talk to us, from its kernel-reported
/// uid. `check_authorization` may block; the transport always invokes it on a
/// blocking-capable runner, never under the transport lock.
pub trait SecurityPolicy: Send + Sync {
    /// `OK` to allow the peer, any other status to reject it with.
    fn check_authorization(&self, uid: Uid) -> Status;

    /// The security level to attribute to an authorized connection.
    fn security_level(&self, remote_uid: Uid, local_uid: Uid) -> SecurityLevel {
        default_security_level(remote_uid, local_uid)
    }
}

/// The binding layer that acquires the initial reference to the server's
/// hosting receiver. Outcomes are reported to the [`BindingObserver`] the
/// binding was created with.
pub trait ServiceBinding: Send + Sync {
    /// Start binding. Invoked outside the transport lock.
    fn bind(&self);
    /// Release the binding.
    fn unbind(&self);
}

/// Callbacks from a [`ServiceBinding`].
pub trait BindingObserver: Send + Sync {
    /// The binding produced a reference to the server's hosting receiver.
    fn on_bound(&self, endpoint: Endpoint);
    /// The binding was lost or never came up.
    fn on_unbound(&self, status: Status);
}

/// Construction parameters for a client transport.
#[derive(Debug, Clone)]
pub struct ClientTransportOptions {
    /// Uid of our own process.
    pub local_uid: Uid,
    /// Our own address, surfaced in attributes.
    pub local_address: ServiceAddress,
    /// The server address we bind to.
    pub target: ServiceAddress,
    /// The authority the server presents as, if different from the target.
    pub server_authority: Option<String>,
    /// Structured-payload policy for inbound parcels.
    pub parcel_policy: InboundParcelPolicy,
}

/// Client side of a transport.
pub struct ClientTransport {
    core: Arc<TransportCore>,
    binding: Box<dyn ServiceBinding>,
    security_policy: Arc<dyn SecurityPolicy>,
    blocking: Arc<dyn TaskRunner>,
    listener: OnceLock<Arc<dyn ManagedClientTransportListener>>,
    /// Number of ongoing calls which keep this transport "in use".
    in_use_streams: AtomicUsize,
    ping_tracker: PingTracker,
    local_uid: Uid,
    self_weak: Weak<ClientTransport>,
}

impl ClientTransport {
    /// Create a client transport.
    ///
    /// `binding_factory` receives the transport as the binding's observer;
    /// `deferred` runs work that must happen off the transport lock and
    /// `blocking` runs the (possibly blocking) security-policy check.
    pub fn new(
        options: ClientTransportOptions,
        binding_factory: impl FnOnce(Weak<dyn BindingObserver>) -> Box<dyn ServiceBinding>,
        security_policy: Arc<dyn SecurityPolicy>,
        deferred: Arc<dyn TaskRunner>,
        blocking: Arc<dyn TaskRunner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ClientTransport>| {
            let handler: Weak<dyn TransactionHandler> = weak.clone();
            let hooks: Weak<dyn RoleHooks> = weak.clone();
            let watcher: Weak<dyn DeathRecipient> = weak.clone();
            let observer: Weak<dyn BindingObserver> = weak.clone();
            let attrs = TransportAttrs {
                local_address: Some(options.local_address.clone()),
                remote_address: Some(options.target.clone()),
                remote_uid: None,
                server_authority: options.server_authority.clone(),
                // Trust no one until setup establishes the peer identity.
                security_level: SecurityLevel::None,
                parcel_policy: options.parcel_policy,
            };
            ClientTransport {
                core: TransportCore::new(
                    options.local_uid,
                    handler,
                    hooks,
                    watcher,
                    attrs,
                    deferred,
                ),
                binding: binding_factory(observer),
                security_policy,
                blocking,
                listener: OnceLock::new(),
                in_use_streams: AtomicUsize::new(0),
                ping_tracker: PingTracker::new(),
                local_uid: options.local_uid,
                self_weak: weak.clone(),
            }
        })
    }

    /// Start the transport: move to `Setup` and initiate binding.
    pub fn start(&self, listener: Arc<dyn ManagedClientTransportListener>) {
        if self.listener.set(listener).is_err() {
            tracing::warn!("client transport started twice");
            return;
        }
        let should_bind = {
            let mut guarded = self.core.lock();
            if guarded.lifecycle.in_state(TransportState::NotStarted) {
                guarded.lifecycle.transition_to(TransportState::Setup);
                true
            } else {
                false
            }
        };
        if should_bind {
            self.binding.bind();
        }
    }

    /// Create a new stream on this transport.
    ///
    /// `inbound` is handed the allocated call id and returns the call's
    /// inbound handler. On a transport that is already shut down, the stored
    /// shutdown status is returned for the caller to fail the stream with.
    pub fn new_stream(
        self: &Arc<Self>,
        inbound: impl FnOnce(u32) -> Arc<dyn InboundHandler>,
        counts_for_in_use: bool,
    ) -> Result<ClientCall, Status> {
        let mut guarded = self.core.lock();
        if guarded.lifecycle.is_shutdown() {
            return Err(guarded
                .lifecycle
                .shutdown_status()
                .cloned()
                .unwrap_or_else(|| Status::unavailable("transport is shutdown")));
        }
        let call_id = self.core.calls().allocate_call_id();
        let handler = inbound(call_id);
        if self.core.calls().put_if_absent(call_id, handler).is_some() {
            // A full wrap of the id space with the old call still in flight;
            // a bug either way.
            let failure = Status::internal("Clashing call IDs");
            self.core.shutdown_internal(&mut guarded, failure.clone(), true);
            return Err(failure);
        }
        if counts_for_in_use && self.in_use_streams.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(listener) = self.listener.get() {
                listener.transport_in_use(true);
            }
        }
        Ok(ClientCall {
            transport: Arc::downgrade(self),
            call_id,
            counts_for_in_use,
        })
    }

    /// Measure liveness: send a ping and report the round-trip time (or the
    /// failure) to `callback` on `runner`.
    pub fn ping(&self, callback: PingCallback, runner: Arc<dyn TaskRunner>) {
        let core = Arc::clone(&self.core);
        self.ping_tracker
            .start_ping(move |id| core.send_ping(id), callback, runner);
    }

    /// Graceful shutdown: refuse new calls, terminate once in-flight calls
    /// drain.
    pub fn shutdown(&self, reason: Status) {
        let mut guarded = self.core.lock();
        self.core.shutdown_internal(&mut guarded, reason, false);
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

    fn unregister_stream(&self, call: &ClientCall) {
        if !self.core.unregister_call(call.call_id) || !call.counts_for_in_use {
            return;
        }
        // Termination may already have reset the counter; never go below
        // zero, and report the 1 -> 0 edge exactly once.
        let mut current = self.in_use_streams.load(Ordering::SeqCst);
        while current > 0 {
            match self.in_use_streams.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if current == 1 {
                        if let Some(listener) = self.listener.get() {
                            listener.transport_in_use(false);
                        }
                    }
                    break;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Evaluate the security policy against the peer uid captured at setup,
    /// then finish the handshake. Runs on the blocking runner with no lock
    /// held; everything after the check re-validates state under the lock.
    fn check_security_policy(&self, endpoint: Endpoint) {
        let remote_uid = self.core.lock().attrs.remote_uid;
        let authorization = match remote_uid {
            None => Status::unauthenticated("No remote UID available"),
            Some(uid) => self.security_policy.check_authorization(uid),
        };
        let mut guarded = self.core.lock();
        if !guarded.lifecycle.in_state(TransportState::Setup) {
            return;
        }
        if !authorization.is_ok() {
            self.core
                .shutdown_internal(&mut guarded, authorization, true);
        } else if !self.core.set_outgoing(&mut guarded, endpoint) {
            self.core.shutdown_internal(
                &mut guarded,
                Status::unavailable("Failed to observe outgoing endpoint"),
                true,
            );
        } else if !guarded.lifecycle.is_shutdown() {
            // Installing the watcher can trigger callbacks that shut us
            // down; only then is the transport ready.
            guarded.lifecycle.transition_to(TransportState::Ready);
            if let Some(listener) = self.listener.get() {
                listener.transport_ready();
            }
        }
    }
}

impl RoleHooks for ClientTransport {
    fn notify_shutdown(&self, status: &Status) {
        if let Some(listener) = self.listener.get() {
            listener.transport_shutdown(status);
        }
    }

    fn notify_terminated(&self) {
        if self.in_use_streams.swap(0, Ordering::SeqCst) > 0 {
            if let Some(listener) = self.listener.get() {
                listener.transport_in_use(false);
            }
        }
        self.binding.unbind();
        if let Some(listener) = self.listener.get() {
            listener.transport_terminated();
        }
    }

    fn create_inbound(
        &self,
        _guarded: &mut Guarded,
        _call_id: u32,
    ) -> Option<Arc<dyn InboundHandler>> {
        // The client only ever receives for ids it allocated.
        None
    }

    fn handle_setup_transport(&self, guarded: &mut Guarded, mut parcel: Parcel) {
        // The peer identity is authoritative regardless of setup state.
        if let Some(uid) = calling_uid() {
            guarded.attrs.remote_uid = Some(uid);
            guarded.attrs.security_level =
                self.security_policy.security_level(uid, self.local_uid);
        }
        if !guarded.lifecycle.in_state(TransportState::Setup) {
            return;
        }
        let frame = SetupFrame::decode(&mut parcel);
        if frame.version != wire::WIRE_FORMAT_VERSION {
            self.core.shutdown_internal(
                guarded,
                Status::unavailable("Wire format version mismatch"),
                true,
            );
            return;
        }
        let Some(endpoint) = frame.peer else {
            self.core.shutdown_internal(
                guarded,
                Status::unavailable("Malformed SETUP_TRANSPORT data"),
                true,
            );
            return;
        };
        let this = self.self_weak.clone();
        self.blocking.execute(Box::new(move || {
            if let Some(this) = this.upgrade() {
                this.check_security_policy(endpoint);
            }
        }));
    }

    fn handle_ping_response(&self, _guarded: &mut Guarded, mut parcel: Parcel) {
        if let Some(id) = wire::decode_ping_id(&mut parcel) {
            self.ping_tracker.on_ping_response(id);
        }
    }
}

impl TransactionHandler for ClientTransport {
    fn handle_transaction(&self, code: u32, parcel: Parcel) -> bool {
        self.core.handle_transaction(code, parcel)
    }
}

impl DeathRecipient for ClientTransport {
    fn peer_died(&self) {
        self.core.on_peer_died();
    }
}

impl BindingObserver for ClientTransport {
    fn on_bound(&self, endpoint: Endpoint) {
        let mut guarded = self.core.lock();
        self.core.send_setup_transaction(&mut guarded, &endpoint);
    }

    fn on_unbound(&self, status: Status) {
        let mut guarded = self.core.lock();
        self.core.shutdown_internal(&mut guarded, status, true);
    }
}

/// The outbound capability of one client call.
///
/// Holds only a weak reference back to the transport; the transport owns the
/// call table and drops the strong references at termination.
#[derive(Debug)]
pub struct ClientCall {
    transport: Weak<ClientTransport>,
    call_id: u32,
    counts_for_in_use: bool,
}

impl ClientCall {
    /// The call id multiplexing this stream.
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
            transport.unregister_stream(self);
        }
    }
}
