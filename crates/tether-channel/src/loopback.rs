//! In-process loopback channel.
//!
//! Each [`Receiver`] owns a FIFO queue drained by a dedicated dispatcher
//! thread, so transactions sent through any endpoint to the same receiver are
//! delivered one at a time, in order, off the sender's stack: the delivery
//! semantics of the kernel primitive. Process death is simulated per
//! receiver: [`Receiver::kill`] fails all future transacts and fires every
//! registered death link exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::channel::{
    CallingUidGuard, DeathLink, DeathRecipient, Endpoint, MessageChannel, TransactionHandler, Uid,
};
use crate::error::ChannelError;
use crate::parcel::Parcel;
use crate::MAX_TRANSACTION_BYTES;

struct Message {
    code: u32,
    parcel: Parcel,
    caller_uid: Uid,
}

struct ReceiverInner {
    owner_uid: Uid,
    handler: RwLock<Option<Weak<dyn TransactionHandler>>>,
    queue: mpsc::Sender<Message>,
    dead: AtomicBool,
    links: Mutex<Vec<(u64, Weak<dyn DeathRecipient>)>>,
    next_link_id: AtomicU64,
}

/// A receiver object: the in-process end of a loopback channel.
///
/// Peers reach it through endpoints minted with [`Receiver::endpoint_for`] or
/// carried inside a [`Parcel`]. Inbound transactions are handed to the
/// attached [`TransactionHandler`]; while detached they are dropped.
pub struct Receiver {
    inner: Arc<ReceiverInner>,
}

impl Receiver {
    /// Create a receiver owned by the process with `owner_uid`, delivering to
    /// `handler`.
    #[must_use]
    pub fn new(owner_uid: Uid, handler: Weak<dyn TransactionHandler>) -> Self {
        let (queue, rx) = mpsc::channel();
        let inner = Arc::new(ReceiverInner {
            owner_uid,
            handler: RwLock::new(Some(handler)),
            queue,
            dead: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
            next_link_id: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&inner);
        thread::spawn(move || dispatch_loop(rx, weak));
        Self { inner }
    }

    /// Uid of the owning process.
    #[must_use]
    pub fn owner_uid(&self) -> Uid {
        self.inner.owner_uid
    }

    /// Replace the attached handler.
    pub fn attach(&self, handler: Weak<dyn TransactionHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Detach the handler; queued and future transactions are dropped.
    pub fn detach(&self) {
        *self.inner.handler.write() = None;
    }

    /// An endpoint to this receiver as held by its own process.
    #[must_use]
    pub fn as_endpoint(&self) -> Endpoint {
        self.endpoint_for(self.inner.owner_uid)
    }

    /// Mint an endpoint to this receiver as held by the process `holder_uid`.
    #[must_use]
    pub fn endpoint_for(&self, holder_uid: Uid) -> Endpoint {
        Arc::new(LoopbackEndpoint {
            target: Arc::downgrade(&self.inner),
            caller_uid: holder_uid,
        })
    }

    /// Simulate death of the owning process: all endpoints to this receiver
    /// start failing with [`ChannelError::DeadEndpoint`], undelivered
    /// transactions are dropped, and every registered death link fires once.
    pub fn kill(&self) {
        if self.inner.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("receiver of uid {} killed", self.inner.owner_uid);
        let links = std::mem::take(&mut *self.inner.links.lock());
        for (_, recipient) in links {
            if let Some(recipient) = recipient.upgrade() {
                recipient.peer_died();
            }
        }
    }
}

fn dispatch_loop(rx: mpsc::Receiver<Message>, inner: Weak<ReceiverInner>) {
    while let Ok(message) = rx.recv() {
        let Some(inner) = inner.upgrade() else { break };
        if inner.dead.load(Ordering::SeqCst) {
            continue;
        }
        let handler = inner.handler.read().clone();
        let Some(handler) = handler.and_then(|w| w.upgrade()) else {
            continue;
        };
        let parcel = message.parcel.rebound_to(inner.owner_uid);
        let code = message.code;
        drop(inner);
        let _uid = CallingUidGuard::new(message.caller_uid);
        if !handler.handle_transaction(code, parcel) {
            tracing::debug!("transaction code {code} not handled");
        }
    }
}

struct LoopbackEndpoint {
    target: Weak<ReceiverInner>,
    caller_uid: Uid,
}

impl MessageChannel for LoopbackEndpoint {
    fn transact(&self, code: u32, parcel: Parcel) -> Result<bool, ChannelError> {
        let Some(target) = self.target.upgrade() else {
            return Err(ChannelError::DeadEndpoint);
        };
        if target.dead.load(Ordering::SeqCst) {
            return Err(ChannelError::DeadEndpoint);
        }
        let size = parcel.data_size();
        if size > MAX_TRANSACTION_BYTES {
            return Err(ChannelError::PayloadTooLarge(size));
        }
        target
            .queue
            .send(Message {
                code,
                parcel,
                caller_uid: self.caller_uid,
            })
            .map_err(|_| ChannelError::DeadEndpoint)?;
        Ok(true)
    }

    fn link_to_death(
        &self,
        recipient: Weak<dyn DeathRecipient>,
    ) -> Result<DeathLink, ChannelError> {
        let Some(target) = self.target.upgrade() else {
            return Err(ChannelError::DeadEndpoint);
        };
        if target.dead.load(Ordering::SeqCst) {
            return Err(ChannelError::DeadEndpoint);
        }
        let id = target.next_link_id.fetch_add(1, Ordering::SeqCst);
        target.links.lock().push((id, recipient));
        let weak = self.target.clone();
        Ok(DeathLink::new(Box::new(move || {
            if let Some(target) = weak.upgrade() {
                target.links.lock().retain(|(link_id, _)| *link_id != id);
            }
        })))
    }

    fn with_caller(self: Arc<Self>, holder_uid: Uid) -> Endpoint {
        Arc::new(LoopbackEndpoint {
            target: self.target.clone(),
            caller_uid: holder_uid,
        })
    }
}
