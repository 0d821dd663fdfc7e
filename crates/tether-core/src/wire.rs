//! Wire codec for the transport's control transactions and the flag header
//! of stream transactions.
//!
//! The low transaction codes are reserved for the five control transactions;
//! everything from [`FIRST_CALL_ID`] up is a stream transaction whose code
//! doubles as the call id. Stream payloads open with an `i32` flag word; the
//! rest of the body belongs to the stream-framing layer above the transport.

use tether_channel::{Endpoint, Parcel};

use crate::status::{Status, StatusCode};

/// Lowest transaction code the channel primitive allows.
pub const FIRST_TRANSACTION_CODE: u32 = 1;

/// Highest transaction code the channel primitive allows.
pub const LAST_TRANSACTION_CODE: u32 = 0x00FF_FFFF;

/// Initiates a transport: `i32 wire_version` plus the sender's receiver
/// object. Sent client-to-server on bind, then echoed server-to-client.
pub const SETUP_TRANSPORT: u32 = FIRST_TRANSACTION_CODE;

/// Shuts down the transport from either end. Empty payload.
pub const SHUTDOWN_TRANSPORT: u32 = FIRST_TRANSACTION_CODE + 1;

/// Acknowledges receipt of stream bytes for flow control: `i64 total`.
pub const ACKNOWLEDGE_BYTES: u32 = FIRST_TRANSACTION_CODE + 2;

/// A ping request: `i32 id`.
pub const PING: u32 = FIRST_TRANSACTION_CODE + 3;

/// A response to a ping: `i32 id`.
pub const PING_RESPONSE: u32 = FIRST_TRANSACTION_CODE + 4;

/// Transaction codes reserved for control use.
pub const RESERVED_TRANSACTIONS: u32 = 1000;

/// The first transaction code usable as a call id.
pub const FIRST_CALL_ID: u32 = FIRST_TRANSACTION_CODE + RESERVED_TRANSACTIONS;

/// One past the last transaction code usable as a call id.
pub const LAST_CALL_ID: u32 = LAST_TRANSACTION_CODE;

/// Version code of this wire format.
pub const WIRE_FORMAT_VERSION: i32 = 1;

/// The earliest wire format version this implementation accepts.
pub const EARLIEST_SUPPORTED_WIRE_FORMAT_VERSION: i32 = 1;

/// The flag word opening every stream transaction.
///
/// Only [`StreamFlags::OUT_OF_BAND_CLOSE`] is interpreted by the transport
/// itself; the remaining bits belong to the stream-framing layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags(i32);

impl StreamFlags {
    /// Metadata prefix present.
    pub const PREFIX: i32 = 0x1;
    /// Message data present.
    pub const MESSAGE_DATA: i32 = 0x2;
    /// Trailing metadata present.
    pub const SUFFIX: i32 = 0x4;
    /// Abnormal close carrying a status, bypassing in-band framing.
    pub const OUT_OF_BAND_CLOSE: i32 = 0x8;
    /// The sender will produce exactly one message on this stream.
    pub const EXPECT_SINGLE_MESSAGE: i32 = 0x10;
    /// A status description string follows the status code.
    pub const STATUS_DESCRIPTION: i32 = 0x20;

    /// Wrap a raw flag word.
    #[must_use]
    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    /// The raw flag word.
    #[must_use]
    pub fn bits(self) -> i32 {
        self.0
    }

    /// Whether the out-of-band close bit is set.
    #[must_use]
    pub fn is_out_of_band_close(self) -> bool {
        self.0 & Self::OUT_OF_BAND_CLOSE != 0
    }

    /// Whether a status description string is present.
    #[must_use]
    pub fn has_status_description(self) -> bool {
        self.0 & Self::STATUS_DESCRIPTION != 0
    }
}

/// The decoded body of a `SETUP_TRANSPORT` transaction.
pub struct SetupFrame {
    /// The peer's wire format version.
    pub version: i32,
    /// The peer's receiver object, if the payload carried one.
    pub peer: Option<Endpoint>,
}

impl SetupFrame {
    /// Encode a setup transaction carrying our version and receiver.
    #[must_use]
    pub fn encode(receiver: Endpoint) -> Parcel {
        let mut parcel = Parcel::new();
        parcel.write_i32(WIRE_FORMAT_VERSION);
        parcel.write_object(receiver);
        parcel
    }

    /// Decode a setup transaction.
    ///
    /// A truncated payload decodes as version 0, which no implementation
    /// sends, so the caller's version check rejects it.
    #[must_use]
    pub fn decode(parcel: &mut Parcel) -> Self {
        let version = parcel.read_i32().unwrap_or(0);
        let peer = parcel.read_object();
        SetupFrame { version, peer }
    }
}

/// Encode an `ACKNOWLEDGE_BYTES` transaction.
#[must_use]
pub fn encode_acknowledge_bytes(total_received: u64) -> Parcel {
    let mut parcel = Parcel::new();
    parcel.write_i64(total_received as i64);
    parcel
}

/// Decode an `ACKNOWLEDGE_BYTES` transaction.
pub fn decode_acknowledge_bytes(parcel: &mut Parcel) -> Option<u64> {
    parcel.read_i64().ok().map(|n| n as u64)
}

/// Encode a `PING` or `PING_RESPONSE` transaction.
#[must_use]
pub fn encode_ping_id(id: u32) -> Parcel {
    let mut parcel = Parcel::new();
    parcel.write_i32(id as i32);
    parcel
}

/// Decode a `PING` or `PING_RESPONSE` transaction.
pub fn decode_ping_id(parcel: &mut Parcel) -> Option<u32> {
    parcel.read_i32().ok().map(|id| id as u32)
}

/// Encode an out-of-band close for a stream: the flag word with
/// [`StreamFlags::OUT_OF_BAND_CLOSE`] set, then the status.
#[must_use]
pub fn encode_out_of_band_close(status: &Status) -> Parcel {
    let mut flags = StreamFlags::OUT_OF_BAND_CLOSE;
    let description = status.message();
    if !description.is_empty() {
        flags |= StreamFlags::STATUS_DESCRIPTION;
    }
    let mut parcel = Parcel::new();
    parcel.write_i32(flags);
    parcel.write_i32(status.code().wire_value());
    if !description.is_empty() {
        parcel.write_str(description);
    }
    parcel
}

/// Read the flag word opening a stream transaction.
pub fn read_stream_flags(parcel: &mut Parcel) -> Option<StreamFlags> {
    parcel.read_i32().ok().map(StreamFlags::from_bits)
}

/// Read the status of an out-of-band close, after the flag word.
#[must_use]
pub fn read_close_status(flags: StreamFlags, parcel: &mut Parcel) -> Status {
    let code = parcel
        .read_i32()
        .map(StatusCode::from_wire_value)
        .unwrap_or(StatusCode::Unknown);
    let message = if flags.has_status_description() {
        parcel.read_str().unwrap_or_default()
    } else {
        String::new()
    };
    Status::new(code, message)
}
