//! Error types for channel operations.

use std::borrow::Cow;
use thiserror::Error;

/// Errors surfaced by [`MessageChannel::transact`](crate::MessageChannel::transact)
/// and death-link registration.
#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    /// The process owning the target receiver has died.
    #[error("endpoint is dead")]
    DeadEndpoint,

    /// The transaction payload exceeds the channel's shared buffer limit.
    #[error("transaction payload of {0} bytes exceeds the channel limit")]
    PayloadTooLarge(usize),

    /// Any other channel failure.
    #[error("channel error: {0}")]
    Other(Cow<'static, str>),
}

impl ChannelError {
    /// Create an [`ChannelError::Other`] with static context (zero allocation).
    #[must_use]
    pub const fn other(context: &'static str) -> Self {
        ChannelError::Other(Cow::Borrowed(context))
    }

    /// Returns true if this error means the peer can no longer be reached at
    /// all, as opposed to a single transaction being refused.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        matches!(self, ChannelError::DeadEndpoint)
    }
}

/// Errors from reading structured data out of a [`Parcel`](crate::Parcel).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParcelError {
    /// The read cursor ran past the end of the byte payload.
    #[error("unexpected end of parcel data")]
    UnexpectedEof,

    /// A string field did not hold valid UTF-8.
    #[error("parcel string is not valid UTF-8")]
    InvalidString,
}
