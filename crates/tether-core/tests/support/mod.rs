//! Shared fixtures for transport integration tests: a scriptable fake peer,
//! a binding that hands out a canned endpoint, recording listeners and
//! inbounds, and a front-door host that spins up real server transports.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;

use tether_channel::{
    calling_uid, Endpoint, Parcel, Receiver, ServiceAddress, TransactionHandler, Uid,
};
use tether_core::client::{
    BindingObserver, ClientTransport, ClientTransportOptions, ManagedClientTransportListener,
    SecurityPolicy, ServiceBinding,
};
use tether_core::server::{
    ServerTransport, ServerTransportListener, ServerTransportOptions,
};
use tether_core::wire::{self, SetupFrame, StreamFlags};
use tether_core::{
    InboundHandler, InboundParcelPolicy, Metadata, Status, ThreadRunner, TransportAttrs,
};

pub const CLIENT_UID: Uid = 10_001;
pub const PEER_UID: Uid = 10_002;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET_TIMEOUT: Duration = Duration::from_millis(250);

/// Route transport logs through the test harness.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Wait for the next event or fail the test.
pub fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(RECV_TIMEOUT).expect("expected an event")
}

/// Assert that no event arrives for a short while.
pub fn assert_quiet<T: std::fmt::Debug>(rx: &mpsc::Receiver<T>) {
    if let Ok(event) = rx.recv_timeout(QUIET_TIMEOUT) {
        panic!("expected no event, got {event:?}");
    }
}

// ---------------------------------------------------------------------------
// Client-side fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub enum ClientEvent {
    Ready,
    Shutdown(Status),
    Terminated,
    InUse(bool),
}

pub struct RecordingListener {
    events: mpsc::Sender<ClientEvent>,
}

impl ManagedClientTransportListener for RecordingListener {
    fn transport_ready(&self) {
        self.events.send(ClientEvent::Ready).ok();
    }
    fn transport_shutdown(&self, status: &Status) {
        self.events.send(ClientEvent::Shutdown(status.clone())).ok();
    }
    fn transport_terminated(&self) {
        self.events.send(ClientEvent::Terminated).ok();
    }
    fn transport_in_use(&self, in_use: bool) {
        self.events.send(ClientEvent::InUse(in_use)).ok();
    }
}

#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    Transaction { data_size: usize },
    Ready,
    Closed(Status),
}

pub struct RecordingInbound {
    events: mpsc::Sender<StreamEvent>,
    ready_count: AtomicUsize,
}

impl RecordingInbound {
    pub fn ready_count(&self) -> usize {
        self.ready_count.load(Ordering::SeqCst)
    }
}

impl InboundHandler for RecordingInbound {
    fn handle_transaction(&self, parcel: Parcel) {
        self.events
            .send(StreamEvent::Transaction {
                data_size: parcel.data_size(),
            })
            .ok();
    }
    fn on_transport_ready(&self) {
        self.ready_count.fetch_add(1, Ordering::SeqCst);
        self.events.send(StreamEvent::Ready).ok();
    }
    fn close_abnormal(&self, status: Status) {
        self.events.send(StreamEvent::Closed(status)).ok();
    }
}

pub fn recording_inbound() -> (Arc<RecordingInbound>, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel();
    (
        Arc::new(RecordingInbound {
            events: tx,
            ready_count: AtomicUsize::new(0),
        }),
        rx,
    )
}

pub struct AllowAllPolicy;

impl SecurityPolicy for AllowAllPolicy {
    fn check_authorization(&self, _uid: Uid) -> Status {
        Status::ok()
    }
}

pub struct DenyPolicy(pub Status);

impl SecurityPolicy for DenyPolicy {
    fn check_authorization(&self, _uid: Uid) -> Status {
        self.0.clone()
    }
}

/// A binding that immediately reports the endpoint it was built with.
pub struct TestBinding {
    observer: Mutex<Weak<dyn BindingObserver>>,
    target: Endpoint,
    unbinds: Arc<AtomicUsize>,
}

impl ServiceBinding for TestBinding {
    fn bind(&self) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer.upgrade() {
            observer.on_bound(self.target.clone());
        }
    }
    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn client_options() -> ClientTransportOptions {
    ClientTransportOptions {
        local_uid: CLIENT_UID,
        local_address: ServiceAddress::new("client.app"),
        target: ServiceAddress::new("server.app/rpc"),
        server_authority: Some("server.app".into()),
        parcel_policy: InboundParcelPolicy::default(),
    }
}

/// A started client wired to `target` through a [`TestBinding`].
pub fn started_client(
    target: Endpoint,
    policy: Arc<dyn SecurityPolicy>,
) -> (
    Arc<ClientTransport>,
    mpsc::Receiver<ClientEvent>,
    Arc<AtomicUsize>,
) {
    init_tracing();
    let unbinds = Arc::new(AtomicUsize::new(0));
    let unbinds2 = Arc::clone(&unbinds);
    let client = ClientTransport::new(
        client_options(),
        move |observer| {
            Box::new(TestBinding {
                observer: Mutex::new(observer),
                target,
                unbinds: unbinds2,
            })
        },
        policy,
        ThreadRunner::shared(),
        ThreadRunner::shared(),
    );
    let (tx, rx) = mpsc::channel();
    client.start(Arc::new(RecordingListener { events: tx }));
    (client, rx, unbinds)
}

// ---------------------------------------------------------------------------
// A scriptable fake peer (plays the server end by hand)
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub enum PeerEvent {
    Setup { version: i32, carried_endpoint: bool },
    Ack(u64),
    Ping(u32),
    PingResponse(u32),
    Shutdown,
    Stream {
        call_id: u32,
        data_size: usize,
        close_status: Option<Status>,
    },
}

struct PeerHandler {
    events: mpsc::Sender<PeerEvent>,
    client_endpoint: Mutex<Option<Endpoint>>,
    auto_pong: AtomicBool,
}

impl TransactionHandler for PeerHandler {
    fn handle_transaction(&self, code: u32, mut parcel: Parcel) -> bool {
        match code {
            wire::SETUP_TRANSPORT => {
                let frame = SetupFrame::decode(&mut parcel);
                if let Some(endpoint) = &frame.peer {
                    *self.client_endpoint.lock().unwrap() = Some(Arc::clone(endpoint));
                }
                self.events
                    .send(PeerEvent::Setup {
                        version: frame.version,
                        carried_endpoint: frame.peer.is_some(),
                    })
                    .ok();
            }
            wire::SHUTDOWN_TRANSPORT => {
                self.events.send(PeerEvent::Shutdown).ok();
            }
            wire::ACKNOWLEDGE_BYTES => {
                if let Some(total) = wire::decode_acknowledge_bytes(&mut parcel) {
                    self.events.send(PeerEvent::Ack(total)).ok();
                }
            }
            wire::PING => {
                if let Some(id) = wire::decode_ping_id(&mut parcel) {
                    if self.auto_pong.load(Ordering::SeqCst) {
                        let endpoint = self.client_endpoint.lock().unwrap().clone();
                        if let Some(endpoint) = endpoint {
                            endpoint
                                .transact(wire::PING_RESPONSE, wire::encode_ping_id(id))
                                .ok();
                        }
                    }
                    self.events.send(PeerEvent::Ping(id)).ok();
                }
            }
            wire::PING_RESPONSE => {
                if let Some(id) = wire::decode_ping_id(&mut parcel) {
                    self.events.send(PeerEvent::PingResponse(id)).ok();
                }
            }
            call_id if call_id >= wire::FIRST_CALL_ID => {
                let data_size = parcel.data_size();
                let flags = wire::read_stream_flags(&mut parcel).unwrap_or_default();
                let close_status = flags
                    .is_out_of_band_close()
                    .then(|| wire::read_close_status(flags, &mut parcel));
                self.events
                    .send(PeerEvent::Stream {
                        call_id,
                        data_size,
                        close_status,
                    })
                    .ok();
            }
            _ => return false,
        }
        true
    }
}

/// Plays the server end of the wire by hand: records everything the client
/// sends and lets tests inject arbitrary control and stream transactions.
pub struct FakePeer {
    pub uid: Uid,
    pub receiver: Receiver,
    handler: Arc<PeerHandler>,
}

impl FakePeer {
    pub fn new(uid: Uid) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(PeerHandler {
            events: tx,
            client_endpoint: Mutex::new(None),
            auto_pong: AtomicBool::new(false),
        });
        let handler_dyn: Arc<dyn TransactionHandler> = handler.clone();
        let weak: Weak<dyn TransactionHandler> = Arc::downgrade(&handler_dyn);
        let receiver = Receiver::new(uid, weak);
        (
            Self {
                uid,
                receiver,
                handler,
            },
            rx,
        )
    }

    /// Endpoint to this peer's host receiver, as held by the client.
    pub fn host_endpoint(&self) -> Endpoint {
        self.receiver.endpoint_for(CLIENT_UID)
    }

    /// The client's receiver endpoint, captured from its setup transaction.
    pub fn client_endpoint(&self) -> Endpoint {
        self.handler
            .client_endpoint
            .lock()
            .unwrap()
            .clone()
            .expect("no setup received from client yet")
    }

    /// Reflect inbound pings automatically.
    pub fn auto_pong(&self) {
        self.handler.auto_pong.store(true, Ordering::SeqCst);
    }

    /// Reply to the client's setup with our version and receiver.
    pub fn send_setup(&self, version: i32) {
        let mut parcel = Parcel::new();
        parcel.write_i32(version);
        parcel.write_object(self.receiver.endpoint_for(self.uid));
        self.client_endpoint()
            .transact(wire::SETUP_TRANSPORT, parcel)
            .expect("setup send");
    }

    /// Reply to the client's setup carrying an arbitrary endpoint.
    pub fn send_setup_with_endpoint(&self, version: i32, endpoint: Endpoint) {
        let mut parcel = Parcel::new();
        parcel.write_i32(version);
        parcel.write_object(endpoint);
        self.client_endpoint()
            .transact(wire::SETUP_TRANSPORT, parcel)
            .expect("setup send");
    }

    pub fn send_shutdown(&self) {
        self.client_endpoint()
            .transact(wire::SHUTDOWN_TRANSPORT, Parcel::new())
            .expect("shutdown send");
    }

    pub fn send_ack(&self, total: u64) {
        self.client_endpoint()
            .transact(wire::ACKNOWLEDGE_BYTES, wire::encode_acknowledge_bytes(total))
            .expect("ack send");
    }

    pub fn send_ping(&self, id: u32) {
        self.client_endpoint()
            .transact(wire::PING, wire::encode_ping_id(id))
            .expect("ping send");
    }

    /// Send a stream transaction whose byte payload totals `data_size`.
    pub fn send_stream(&self, call_id: u32, data_size: usize) {
        let mut parcel = Parcel::new();
        parcel.write_i32(StreamFlags::MESSAGE_DATA);
        parcel.write_bytes(&vec![0u8; data_size - 4]);
        self.client_endpoint()
            .transact(call_id, parcel)
            .expect("stream send");
    }

    /// Simulate the peer process dying.
    pub fn kill(&self) {
        self.receiver.kill();
    }
}

/// A stream payload whose byte size is exactly `data_size`.
pub fn stream_parcel(data_size: usize) -> Parcel {
    let mut parcel = Parcel::new();
    parcel.write_i32(StreamFlags::MESSAGE_DATA);
    parcel.write_bytes(&vec![0u8; data_size - 4]);
    parcel
}

// ---------------------------------------------------------------------------
// A real server behind a front-door host
// ---------------------------------------------------------------------------

struct NullServerListener;

impl ServerTransportListener for NullServerListener {
    fn transport_ready(&self, attrs: TransportAttrs) -> TransportAttrs {
        attrs
    }
    fn stream_created(
        &self,
        _stream: Arc<dyn InboundHandler>,
        _method_name: &str,
        _headers: Metadata,
    ) {
    }
    fn transport_terminated(&self) {}
}

/// Echoes every inbound stream payload back on the same call.
struct EchoInbound {
    call: tether_core::ServerCall,
}

impl InboundHandler for EchoInbound {
    fn handle_transaction(&self, mut parcel: Parcel) {
        let flags = wire::read_stream_flags(&mut parcel).unwrap_or_default();
        if flags.is_out_of_band_close() {
            return;
        }
        let body = parcel.read_remaining();
        let mut reply = Parcel::new();
        reply.write_i32(StreamFlags::MESSAGE_DATA);
        reply.write_bytes(&body);
        self.call.send(reply).ok();
    }
    fn on_transport_ready(&self) {}
    fn close_abnormal(&self, _status: Status) {}
}

struct HostHandler {
    uid: Uid,
    server: Mutex<Option<Arc<ServerTransport>>>,
}

impl TransactionHandler for HostHandler {
    fn handle_transaction(&self, code: u32, mut parcel: Parcel) -> bool {
        if code != wire::SETUP_TRANSPORT {
            return false;
        }
        let frame = SetupFrame::decode(&mut parcel);
        let Some(client_endpoint) = frame.peer else {
            return false;
        };
        let attrs = TransportAttrs {
            remote_uid: calling_uid(),
            ..TransportAttrs::default()
        };
        let server = ServerTransport::new(
            ServerTransportOptions {
                local_uid: self.uid,
                attrs,
            },
            client_endpoint,
            Box::new(|call| Arc::new(EchoInbound { call }) as Arc<dyn InboundHandler>),
            ThreadRunner::shared(),
        );
        server.set_listener(Arc::new(NullServerListener));
        *self.server.lock().unwrap() = Some(server);
        true
    }
}

/// The binding front door: accepts a client's setup and creates a real
/// echoing [`ServerTransport`] over it.
pub struct TestHost {
    pub receiver: Receiver,
    handler: Arc<HostHandler>,
}

impl TestHost {
    pub fn new(uid: Uid) -> Self {
        let handler = Arc::new(HostHandler {
            uid,
            server: Mutex::new(None),
        });
        let handler_dyn: Arc<dyn TransactionHandler> = handler.clone();
        let weak: Weak<dyn TransactionHandler> = Arc::downgrade(&handler_dyn);
        let receiver = Receiver::new(uid, weak);
        Self { receiver, handler }
    }

    pub fn host_endpoint(&self) -> Endpoint {
        self.receiver.endpoint_for(CLIENT_UID)
    }

    pub fn server(&self) -> Option<Arc<ServerTransport>> {
        self.handler.server.lock().unwrap().clone()
    }
}
