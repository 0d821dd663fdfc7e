//! The channel seam: endpoint trait, death links, caller identity.
//!
//! A [`MessageChannel`] is a reference to a receiver object living in some
//! process. Transactions sent through it are delivered one-way, in FIFO
//! order, to whatever handler the owner attached. The holder can register for
//! death notification of the owning process.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::ChannelError;
use crate::parcel::Parcel;

/// Kernel-assigned numeric user id of a process.
pub type Uid = u32;

/// A strong reference to a remote receiver object.
pub type Endpoint = Arc<dyn MessageChannel>;

/// The name a server publishes its hosting receiver under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress(String);

impl ServiceAddress {
    /// Create an address from a service name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receives transactions delivered to a receiver object.
///
/// Returning `false` reports that the transaction code was not understood.
pub trait TransactionHandler: Send + Sync {
    /// Handle one inbound transaction.
    fn handle_transaction(&self, code: u32, parcel: Parcel) -> bool;
}

/// Observes the death of the process behind an endpoint.
pub trait DeathRecipient: Send + Sync {
    /// The peer process died. Invoked at most once per link.
    fn peer_died(&self);
}

/// A registered death link. Dropping it unregisters the recipient.
pub struct DeathLink {
    unlink: Option<Box<dyn FnOnce() + Send>>,
}

impl DeathLink {
    /// Wrap an unlink action.
    #[must_use]
    pub fn new(unlink: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            unlink: Some(unlink),
        }
    }

    /// Explicitly unregister the recipient.
    pub fn unlink(mut self) {
        if let Some(f) = self.unlink.take() {
            f();
        }
    }
}

impl Drop for DeathLink {
    fn drop(&mut self) {
        if let Some(f) = self.unlink.take() {
            f();
        }
    }
}

impl fmt::Debug for DeathLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeathLink")
            .field("linked", &self.unlink.is_some())
            .finish()
    }
}

/// A one-way, ordered message channel to a receiver object in some process.
pub trait MessageChannel: Send + Sync {
    /// Send one transaction. Delivery is asynchronous and ordered with
    /// respect to other transactions sent through endpoints to the same
    /// receiver. `Ok(false)` means the transaction was refused without being
    /// delivered; errors mean the channel itself failed.
    fn transact(&self, code: u32, parcel: Parcel) -> Result<bool, ChannelError>;

    /// Register for notification when the owning process dies. Fails with
    /// [`ChannelError::DeadEndpoint`] if it is already dead.
    fn link_to_death(
        &self,
        recipient: Weak<dyn DeathRecipient>,
    ) -> Result<DeathLink, ChannelError>;

    /// This reference as held by the process with the given uid.
    ///
    /// The kernel rebinds references as they cross a process boundary so the
    /// receiving side observes the correct caller identity; the loopback
    /// implementation does the same on delivery.
    fn with_caller(self: Arc<Self>, holder_uid: Uid) -> Endpoint;
}

thread_local! {
    static CALLING_UID: Cell<Option<Uid>> = const { Cell::new(None) };
}

/// The uid of the process whose transaction is currently being dispatched on
/// this thread, or `None` outside of a dispatch.
#[must_use]
pub fn calling_uid() -> Option<Uid> {
    CALLING_UID.with(Cell::get)
}

/// RAII guard installing the ambient calling uid for the current dispatch.
pub(crate) struct CallingUidGuard {
    previous: Option<Uid>,
}

impl CallingUidGuard {
    pub(crate) fn new(uid: Uid) -> Self {
        let previous = CALLING_UID.with(|c| c.replace(Some(uid)));
        Self { previous }
    }
}

impl Drop for CallingUidGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        CALLING_UID.with(|c| c.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_calling_uid_scoped() {
        assert_eq!(calling_uid(), None);
        {
            let _guard = CallingUidGuard::new(1001);
            assert_eq!(calling_uid(), Some(1001));
            {
                let _inner = CallingUidGuard::new(2002);
                assert_eq!(calling_uid(), Some(2002));
            }
            assert_eq!(calling_uid(), Some(1001));
        }
        assert_eq!(calling_uid(), None);
    }

    #[test]
    fn test_death_link_runs_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let link = DeathLink::new(Box::new(move || {
            assert!(!fired2.swap(true, Ordering::SeqCst));
        }));
        link.unlink();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_death_link_unlinks_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        drop(DeathLink::new(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        })));
        assert!(fired.load(Ordering::SeqCst));
    }
}
