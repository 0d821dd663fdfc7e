//! # Tether Core
//!
//! The transport core of an RPC layer that carries streaming RPCs over an
//! on-device message channel: a symmetric peer that multiplexes many
//! concurrent calls over a single duplex pair of one-way channels.
//!
//! This crate provides:
//! - Wire codec for the five control transactions and stream flag headers
//! - Credit-based flow control over a shared byte window
//! - Concurrent call table with client-side call-id allocation
//! - The five-state transport lifecycle with guarded transitions
//! - Setup handshake with peer authorization
//! - Ping/pong liveness tracking
//! - Client and server transport roles
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                ClientTransport / ServerTransport                 │
//! │   (setup order, call-id policy, listener notifications)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        TransportCore                             │
//! │   (dispatch, sends, lifecycle funnel, flow integration)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │     CallTable │ FlowController │ Lifecycle │ PingTracker        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       tether-channel                             │
//! │   (ordered one-way transactions, death links, caller uids)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Streams above the transport implement [`InboundHandler`] to consume
//! inbound transactions and hold a [`ClientCall`] / [`ServerCall`] to produce
//! outbound ones. The transport owns the call table; calls keep only weak
//! references back.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod attrs;
pub mod calls;
pub mod client;
pub mod flow;
pub mod fsm;
pub mod ping;
pub mod runner;
pub mod server;
pub mod status;
mod transport;
pub mod wire;

pub use attrs::{InboundParcelPolicy, SecurityLevel, TransportAttrs};
pub use calls::{CallTable, InboundHandler};
pub use client::{
    BindingObserver, ClientCall, ClientTransport, ClientTransportOptions,
    ManagedClientTransportListener, SecurityPolicy, ServiceBinding,
};
pub use flow::{FlowController, TRANSACTION_BYTES_WINDOW, TRANSACTION_BYTES_WINDOW_FORCE_ACK};
pub use fsm::TransportState;
pub use ping::{PingCallback, PingTracker};
pub use runner::{TaskRunner, ThreadRunner, TokioRunner};
pub use server::{
    ServerCall, ServerInboundFactory, ServerTransport, ServerTransportListener,
    ServerTransportOptions,
};
pub use status::{Status, StatusCode};

/// Stream headers handed to the server listener on stream creation.
pub type Metadata = std::collections::BTreeMap<String, Vec<u8>>;
