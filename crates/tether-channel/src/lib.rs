//! # Tether Channel
//!
//! The on-device message-passing primitive the tether RPC transport rides on:
//! an ordered, one-way channel between two processes, each identified by a
//! kernel-assigned numeric user id. Either endpoint can hand the other a
//! reference to a receiver object, and can observe the peer process's death.
//!
//! This crate provides:
//! - The [`MessageChannel`] trait (transact, death links, caller identity)
//! - [`Parcel`], the byte-plus-object-reference payload container
//! - [`Receiver`], the attachable receiver object handed to peers
//! - An in-process loopback implementation with per-receiver FIFO delivery
//!   and simulated process death, used by tests and demos
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Transactions                           │
//! │     (code + parcel, delivered one-way in FIFO order)         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                  Endpoint  ──►  Receiver                      │
//! │   (reference held by one process, object owned by the other) │
//! ├──────────────────────────────────────────────────────────────┤
//! │              Death links and caller identity                  │
//! │      (peer-death callbacks, ambient calling uid)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod channel;
pub mod error;
pub mod loopback;
pub mod parcel;

pub use channel::{
    calling_uid, DeathLink, DeathRecipient, Endpoint, MessageChannel, ServiceAddress,
    TransactionHandler, Uid,
};
pub use error::{ChannelError, ParcelError};
pub use loopback::Receiver;
pub use parcel::Parcel;

/// Largest byte payload a single transaction may carry.
///
/// Oversized transactions fail with [`ChannelError::PayloadTooLarge`] without
/// being delivered, mirroring the kernel primitive's shared buffer limit.
pub const MAX_TRANSACTION_BYTES: usize = 1024 * 1024;
