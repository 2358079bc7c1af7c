//! # Event Subsystem
//!
//! Everything an endpoint reports back to the application arrives as an
//! [`Event`]: send completions, received messages, connection establishment,
//! keepalive expiry, device failure. Events that carry payload bytes (RECV,
//! CONNECT_REQUEST) lease a receive slot from a fixed pool; the application
//! holds the lease until it returns the event, and an exhausted pool is what
//! makes the receive side push back on reliable senders (RNR).
//!
//! ## Lease discipline
//!
//! A slot is owned by exactly one holder at a time: the free pool, the ready
//! queue, or the application. There is no reference counting: returning an
//! event is the only way to recycle its slot, and a leaked event is recycled
//! (with a warning) when it is dropped.

use crate::endpoint::{Attribute, Connection};
use crate::status::Status;
use crate::transport::EndpointOps;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Weak;
use tracing::{trace, warn};

/// A leased receive buffer. The buffer capacity is fixed at pool build time;
/// `len` is the valid prefix for the current lease.
pub(crate) struct RxSlot {
    buf: Box<[u8]>,
    len: usize,
}

impl std::fmt::Debug for RxSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxSlot")
            .field("capacity", &self.buf.len())
            .field("len", &self.len)
            .finish()
    }
}

impl RxSlot {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub(crate) fn fill(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.buf.len());
        self.buf[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Fixed pool of receive slots. Multi-producer (progress engine and
/// returning applications), so the free list is a lock-free queue.
pub(crate) struct SlotPool {
    free: SegQueue<RxSlot>,
    slot_size: usize,
    total: AtomicUsize,
    leased: AtomicUsize,
}

impl SlotPool {
    pub(crate) fn new(count: usize, slot_size: usize) -> Self {
        let free = SegQueue::new();
        for _ in 0..count {
            free.push(RxSlot::with_capacity(slot_size));
        }
        Self {
            free,
            slot_size,
            total: AtomicUsize::new(count),
            leased: AtomicUsize::new(0),
        }
    }

    pub(crate) fn take(&self) -> Option<RxSlot> {
        let slot = self.free.pop()?;
        self.leased.fetch_add(1, Ordering::Relaxed);
        Some(slot)
    }

    pub(crate) fn put(&self, slot: RxSlot) {
        self.leased.fetch_sub(1, Ordering::Relaxed);
        self.free.push(slot);
    }

    /// Slots currently available for new leases.
    pub(crate) fn free_count(&self) -> usize {
        let total = self.total.load(Ordering::Relaxed);
        total.saturating_sub(self.leased.load(Ordering::Relaxed))
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.free_count() == 0
    }

    /// Grow or shrink the pool to `new_total` slots. Shrinking requires the
    /// surrendered slots to be free right now.
    pub(crate) fn resize(&self, new_total: usize) -> Result<(), Status> {
        let total = self.total.load(Ordering::Relaxed);
        if new_total >= total {
            for _ in 0..new_total - total {
                self.free.push(RxSlot::with_capacity(self.slot_size));
            }
            self.total.store(new_total, Ordering::Relaxed);
            return Ok(());
        }
        let mut taken = Vec::new();
        for _ in 0..total - new_total {
            match self.free.pop() {
                Some(slot) => taken.push(slot),
                None => {
                    // Not enough free slots; restore and refuse.
                    for slot in taken {
                        self.free.push(slot);
                    }
                    return Err(Status::Invalid);
                }
            }
        }
        self.total.store(new_total, Ordering::Relaxed);
        Ok(())
    }
}

/// The typed payload of an event, exposed to the application through
/// [`Event::kind`].
#[derive(Debug)]
pub enum EventKind {
    /// A send (or RMA) completed with the given status.
    Send {
        status: Status,
        context: u64,
        connection: Connection,
    },
    /// A message arrived; the bytes are read through [`Event::data`].
    Recv { connection: Connection },
    /// The outcome of a `connect` call.
    Connect {
        status: Status,
        context: u64,
        connection: Option<Connection>,
    },
    /// An incoming connection request. Must be passed to `accept` or
    /// `reject` before the event is returned; the request payload is read
    /// through [`Event::data`].
    ConnectRequest { attribute: Attribute },
    /// The outcome of an `accept` call.
    Accept {
        status: Status,
        context: u64,
        connection: Option<Connection>,
    },
    /// A keepalive period elapsed without any sign of the peer.
    KeepaliveTimedOut { connection: Connection },
    /// The endpoint's device failed irrecoverably.
    EndpointDeviceFailed,
}

/// Internal event record: the public kind plus the lease bookkeeping.
pub struct EventInner {
    pub(crate) kind: EventKind,
    pub(crate) slot: Option<RxSlot>,
    /// Embryonic connection ID for CONNECT_REQUEST events.
    pub(crate) request: Option<u32>,
    /// Set once accept/reject consumed a CONNECT_REQUEST.
    pub(crate) handled: AtomicBool,
}

impl EventInner {
    pub(crate) fn new(kind: EventKind) -> Box<Self> {
        Box::new(Self {
            kind,
            slot: None,
            request: None,
            handled: AtomicBool::new(false),
        })
    }

    pub(crate) fn with_slot(kind: EventKind, slot: RxSlot) -> Box<Self> {
        Box::new(Self {
            kind,
            slot: Some(slot),
            request: None,
            handled: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_unconsumed_request(&self) -> bool {
        self.request.is_some() && !self.handled.load(Ordering::Acquire)
    }
}

/// An event leased to the application. Return it with
/// `Endpoint::return_event`; a dropped event is recycled automatically, but
/// relying on that defeats the back-pressure the lease provides.
pub struct Event {
    pub(crate) ops: Weak<dyn EndpointOps>,
    pub(crate) inner: Option<Box<EventInner>>,
}

impl Event {
    pub(crate) fn new(ops: Weak<dyn EndpointOps>, inner: Box<EventInner>) -> Self {
        Self {
            ops,
            inner: Some(inner),
        }
    }

    /// The typed view of this event.
    ///
    /// # Panics
    ///
    /// Panics if the event was already given back through `return_event`;
    /// the lease ends there and the husk carries no data.
    pub fn kind(&self) -> &EventKind {
        &self.inner.as_ref().expect("event already returned").kind
    }

    /// Payload bytes for RECV and CONNECT_REQUEST events; empty otherwise.
    pub fn data(&self) -> &[u8] {
        self.inner
            .as_ref()
            .and_then(|inner| inner.slot.as_ref())
            .map_or(&[], |slot| slot.data())
    }

    pub(crate) fn request_id(&self) -> Option<u32> {
        self.inner.as_ref().and_then(|inner| inner.request)
    }

    pub(crate) fn mark_handled(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.handled.store(true, Ordering::Release);
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else { return };
        let Some(ops) = self.ops.upgrade() else { return };
        if inner.is_unconsumed_request() {
            warn!("connect-request event dropped without accept/reject; rejecting");
            if let Some(request) = inner.request {
                let _ = ops.reject(request);
                inner.handled.store(true, Ordering::Release);
            }
        } else {
            warn!("event dropped without return_event; recycling lease");
        }
        let _ = ops.return_event(inner);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.as_ref() {
            Some(inner) => f.debug_struct("Event").field("kind", &inner.kind).finish(),
            None => f.write_str("Event(returned)"),
        }
    }
}

/// Single-consumer ready queue with wake signalling on the empty→non-empty
/// transition. Producers are the progress engine and API paths; the consumer
/// is whoever calls `get_event`.
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Box<EventInner>>>,
    waker: Mutex<os_pipe::PipeWriter>,
}

impl EventQueue {
    pub(crate) fn new(waker: os_pipe::PipeWriter) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waker: Mutex::new(waker),
        }
    }

    pub(crate) fn push(&self, inner: Box<EventInner>) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(inner);
            was_empty
        };
        if was_empty {
            self.signal();
        }
    }

    pub(crate) fn pop(&self) -> Option<Box<EventInner>> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Write a wake byte. The pipe is non-blocking; a full pipe already
    /// wakes the poller, so a failed write is fine.
    pub(crate) fn signal(&self) {
        if let Err(err) = self.waker.lock().write(&[1]) {
            trace!(%err, "wake pipe write skipped");
        }
    }

    /// Drain all queued events for endpoint teardown.
    pub(crate) fn drain(&self) -> Vec<Box<EventInner>> {
        self.queue.lock().drain(..).collect()
    }
}

/// Build a standalone slot for state-machine unit tests.
#[cfg(test)]
pub(crate) fn test_slot(capacity: usize) -> RxSlot {
    RxSlot::with_capacity(capacity)
}
