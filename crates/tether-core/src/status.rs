//! RPC status taxonomy.
//!
//! Every failure the transport surfaces is a [`Status`]: a code plus a
//! human-readable message. Statuses are values, not panics; the first status
//! recorded at shutdown is the one every observer sees.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;
use tether_channel::ChannelError;

/// Status codes surfaced by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Not an error.
    Ok,
    /// Unknown failure.
    Unknown,
    /// The caller is denied by policy.
    PermissionDenied,
    /// The operation was rejected because the system is not in a state
    /// required for it.
    FailedPrecondition,
    /// An internal invariant was broken.
    Internal,
    /// The peer is currently unreachable; retriable at a higher layer.
    Unavailable,
    /// The caller's identity could not be established.
    Unauthenticated,
}

impl StatusCode {
    /// Stable numeric value used when a status crosses the wire.
    #[must_use]
    pub fn wire_value(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Unknown => 2,
            StatusCode::PermissionDenied => 7,
            StatusCode::FailedPrecondition => 9,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
            StatusCode::Unauthenticated => 16,
        }
    }

    /// Decode a wire value; unrecognized values collapse to `Unknown`.
    #[must_use]
    pub fn from_wire_value(value: i32) -> Self {
        match value {
            0 => StatusCode::Ok,
            7 => StatusCode::PermissionDenied,
            9 => StatusCode::FailedPrecondition,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// An RPC status: code plus message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: StatusCode,
    message: Cow<'static, str>,
}

impl Status {
    /// The `OK` status.
    #[must_use]
    pub const fn ok() -> Self {
        Status {
            code: StatusCode::Ok,
            message: Cow::Borrowed(""),
        }
    }

    /// Build a status from a code and an owned message.
    pub fn new(code: StatusCode, message: impl Into<Cow<'static, str>>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    /// `UNAVAILABLE` with static context (zero allocation).
    #[must_use]
    pub const fn unavailable(message: &'static str) -> Self {
        Status {
            code: StatusCode::Unavailable,
            message: Cow::Borrowed(message),
        }
    }

    /// `INTERNAL` with static context (zero allocation).
    #[must_use]
    pub const fn internal(message: &'static str) -> Self {
        Status {
            code: StatusCode::Internal,
            message: Cow::Borrowed(message),
        }
    }

    /// `FAILED_PRECONDITION` with static context (zero allocation).
    #[must_use]
    pub const fn failed_precondition(message: &'static str) -> Self {
        Status {
            code: StatusCode::FailedPrecondition,
            message: Cow::Borrowed(message),
        }
    }

    /// `UNAUTHENTICATED` with static context (zero allocation).
    #[must_use]
    pub const fn unauthenticated(message: &'static str) -> Self {
        Status {
            code: StatusCode::Unauthenticated,
            message: Cow::Borrowed(message),
        }
    }

    /// `PERMISSION_DENIED` with static context (zero allocation).
    #[must_use]
    pub const fn permission_denied(message: &'static str) -> Self {
        Status {
            code: StatusCode::PermissionDenied,
            message: Cow::Borrowed(message),
        }
    }

    /// The status code.
    #[must_use]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// The status message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is `OK`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Map a channel failure to a status.
///
/// Dead endpoints and oversize payloads are expected from time to time and
/// map to `UNAVAILABLE` so higher layers can retry; anything else out of the
/// channel is unexpected and maps to `INTERNAL`.
#[must_use]
pub fn status_from_channel_error(error: &ChannelError) -> Status {
    match error {
        ChannelError::DeadEndpoint => Status::unavailable("endpoint is dead"),
        ChannelError::PayloadTooLarge(_) => {
            Status::new(StatusCode::Unavailable, error.to_string())
        }
        ChannelError::Other(_) => Status::new(StatusCode::Internal, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let status = Status::unavailable("peer died");
        assert_eq!(status.to_string(), "UNAVAILABLE: peer died");
        assert_eq!(Status::ok().to_string(), "OK: ");
    }

    #[test]
    fn test_wire_value_roundtrip() {
        for code in [
            StatusCode::Ok,
            StatusCode::Unknown,
            StatusCode::PermissionDenied,
            StatusCode::FailedPrecondition,
            StatusCode::Internal,
            StatusCode::Unavailable,
            StatusCode::Unauthenticated,
        ] {
            assert_eq!(StatusCode::from_wire_value(code.wire_value()), code);
        }
        assert_eq!(StatusCode::from_wire_value(999), StatusCode::Unknown);
    }

    #[test]
    fn test_channel_error_mapping() {
        assert_eq!(
            status_from_channel_error(&ChannelError::DeadEndpoint).code(),
            StatusCode::Unavailable
        );
        assert_eq!(
            status_from_channel_error(&ChannelError::PayloadTooLarge(2_000_000)).code(),
            StatusCode::Unavailable
        );
        assert_eq!(
            status_from_channel_error(&ChannelError::other("queue refused")).code(),
            StatusCode::Internal
        );
    }
}
