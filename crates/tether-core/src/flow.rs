//! Credit-based flow control over the shared transport window.
//!
//! Four monotonically increasing 64-bit byte counters, compared with
//! wrap-aware arithmetic. The sent/received counters are bumped on the stream
//! paths without any lock; the acked counters are written only while the
//! transport lock is held. `transmit_window_full` is a single atomic flag so
//! stream code can consult readiness under its own lock without ever
//! reaching for the transport lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Max in-flight unacknowledged outbound bytes before the send path stalls.
pub const TRANSACTION_BYTES_WINDOW: u64 = 128 * 1024;

/// Received-byte delta that forces an `ACKNOWLEDGE_BYTES` to the peer.
pub const TRANSACTION_BYTES_WINDOW_FORCE_ACK: u64 = 16 * 1024;

/// Monotone update tolerating out-of-order ack deliveries: keeps `a` unless
/// `b` is ahead of it under wrap-aware signed comparison.
#[must_use]
pub fn wrap_aware_max(a: u64, b: u64) -> u64 {
    if (a.wrapping_sub(b) as i64) < 0 {
        b
    } else {
        a
    }
}

/// Per-transport flow-control counters.
#[derive(Debug, Default)]
pub struct FlowController {
    /// Outbound stream bytes we've transmitted.
    bytes_sent: AtomicU64,
    /// Inbound stream bytes we've received.
    bytes_received: AtomicU64,
    /// Of `bytes_sent`, how many the peer has acknowledged. Written only
    /// under the transport lock.
    bytes_sent_acked: AtomicU64,
    /// Of `bytes_received`, how many we've acknowledged to the peer. Written
    /// only under the transport lock.
    bytes_received_acked: AtomicU64,
    /// Too many unacknowledged outbound bytes to accept more stream sends.
    transmit_window_full: AtomicBool,
}

impl FlowController {
    /// Fresh counters, window open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the send path may accept more stream transactions.
    /// Deliberately lock-free: called while per-call locks are held.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.transmit_window_full.load(Ordering::SeqCst)
    }

    /// Record `n` outbound stream bytes. Returns the new total, after
    /// raising the window-full flag if the unacknowledged gap passed the
    /// window.
    pub fn record_sent(&self, n: u64) -> u64 {
        let total = self.bytes_sent.fetch_add(n, Ordering::SeqCst) + n;
        let acked = self.bytes_sent_acked.load(Ordering::SeqCst);
        if total.wrapping_sub(acked) as i64 > TRANSACTION_BYTES_WINDOW as i64 {
            self.transmit_window_full.store(true, Ordering::SeqCst);
        }
        total
    }

    /// Record `n` inbound stream bytes. Returns whether the unacknowledged
    /// inbound gap passed the force-ack threshold and an ack should be sent.
    pub fn record_received(&self, n: u64) -> bool {
        let total = self.bytes_received.fetch_add(n, Ordering::SeqCst) + n;
        let acked = self.bytes_received_acked.load(Ordering::SeqCst);
        total.wrapping_sub(acked) as i64 > TRANSACTION_BYTES_WINDOW_FORCE_ACK as i64
    }

    /// Apply the peer's acknowledged-byte total. Returns true when this ack
    /// reopened a full transmit window, in which case the caller wakes every
    /// in-flight call. Must be called with the transport lock held.
    pub fn on_peer_ack(&self, peer_reported: u64) -> bool {
        let acked = wrap_aware_max(self.bytes_sent_acked.load(Ordering::SeqCst), peer_reported);
        self.bytes_sent_acked.store(acked, Ordering::SeqCst);
        let sent = self.bytes_sent.load(Ordering::SeqCst);
        if (sent.wrapping_sub(acked) as i64) < TRANSACTION_BYTES_WINDOW as i64
            && self.transmit_window_full.load(Ordering::SeqCst)
        {
            self.transmit_window_full.store(false, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Snapshot the received-byte total into the acked counter and return it
    /// for encoding into the outbound ack. Must be called with the transport
    /// lock held.
    pub fn emit_ack(&self) -> u64 {
        let total = self.bytes_received.load(Ordering::SeqCst);
        self.bytes_received_acked.store(total, Ordering::SeqCst);
        total
    }

    /// Total outbound stream bytes so far.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// Total inbound stream bytes so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Outbound bytes the peer has acknowledged.
    #[must_use]
    pub fn bytes_sent_acked(&self) -> u64 {
        self.bytes_sent_acked.load(Ordering::SeqCst)
    }
}
