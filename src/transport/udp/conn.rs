//! # Per-Connection Reliable State
//!
//! Each connection carries an independent sliding window in each direction:
//! the send side tracks in-flight descriptors awaiting acknowledgement and a
//! queue of descriptors waiting for window space; the receive side tracks
//! the highest contiguously delivered sequence, a 32-slot selective bitmap
//! above it, and (for ordered connections) a hold queue of packets that
//! arrived early.
//!
//! Sequence numbers live in the RFC 1982 serial space: comparisons are made
//! with wrapping distance, so the window keeps working across the 32-bit
//! wrap point.

use crate::endpoint::{Attribute, Flags};
use crate::event::RxSlot;
use crate::status::Status;
use crate::transport::udp::rma::RmaQueue;
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-flight descriptors per connection; matches selective-ACK coverage so
/// every outstanding packet can be acknowledged out of order.
pub(crate) const SEND_WINDOW: usize = 32;

/// Hold-queue cap for ordered connections. A conforming peer's window fits
/// entirely; overflow means the peer is broken and fails the connection.
pub(crate) const HOLD_LIMIT: usize = 32;

/// Deferred pre-handshake packets kept per embryonic connection.
pub(crate) const DEFER_LIMIT: usize = 16;

/// First retransmit delay; doubles per resend.
pub(crate) const RETRANS_BASE: Duration = crate::defaults::RETRANSMIT_BASE;

/// Retransmit backoff ceiling.
pub(crate) const RETRANS_CEIL: Duration = crate::defaults::RETRANSMIT_CEILING;

/// Maximum age of a pending acknowledgement before a standalone ACK goes
/// out.
pub(crate) const ACK_DELAY: Duration = crate::defaults::ACK_DELAY;

/// Connect/accept deadline when the caller does not supply one.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = crate::defaults::CONNECT_TIMEOUT;

/// Endpoint-default reliable send deadline.
pub(crate) const DEFAULT_SEND_TIMEOUT: Duration = crate::defaults::SEND_TIMEOUT;

/// Retransmit delay after `resends` attempts.
pub(crate) fn backoff(resends: u32) -> Duration {
    let shifted = RETRANS_BASE.saturating_mul(1u32 << resends.min(16));
    shifted.min(RETRANS_CEIL)
}

/// Completion rendezvous for `BLOCKING` operations: the descriptor (or RMA
/// operation) completes into this instead of the event queue.
pub(crate) struct TxNotify {
    result: Mutex<Option<Status>>,
    cond: Condvar,
}

impl TxNotify {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self, status: Status) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(status);
        }
        self.cond.notify_all();
    }

    /// Wait for completion, periodically waking so the caller can drive
    /// progress itself.
    pub(crate) fn wait_while<F: FnMut()>(&self, mut kick: F) -> Status {
        loop {
            {
                let mut result = self.result.lock();
                if let Some(status) = *result {
                    return status;
                }
                let _ = self
                    .cond
                    .wait_for(&mut result, Duration::from_millis(1));
                if let Some(status) = *result {
                    return status;
                }
            }
            kick();
        }
    }
}

/// What an in-flight descriptor is carrying, for completion bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxKind {
    /// Application message.
    Msg,
    /// RMA write fragment carrying `bytes` of data for operation `op`.
    RmaWrite { op: u64, bytes: u32 },
    /// RMA read request for operation `op`.
    RmaReadRequest { op: u64 },
    /// Data reply serving a peer's read request.
    RmaReadReply,
    /// Remote completion message closing out operation `op`.
    RmaCompletion { op: u64 },
}

/// A send descriptor. Lives in the endpoint TX pool between uses; while in
/// use it sits on exactly one connection list (queued or in-flight).
pub(crate) struct TxDesc {
    /// Full encoded datagram; retransmits re-stamp the ACK fields and send
    /// the same bytes.
    pub packet: Vec<u8>,
    pub seq: u32,
    pub kind: TxKind,
    pub context: u64,
    pub flags: Flags,
    pub deadline: Instant,
    pub last_send: Instant,
    pub resends: u32,
    /// Peer answered this sequence with an RNR NACK; deadline expiry
    /// completes with `Rnr` instead of `TimedOut`.
    pub rnr: bool,
    /// Acknowledged; ordered connections may hold a completed descriptor
    /// until its predecessors complete.
    pub acked: bool,
    pub notify: Option<Arc<TxNotify>>,
}

impl TxDesc {
    fn blank() -> Box<TxDesc> {
        let now = Instant::now();
        Box::new(TxDesc {
            packet: Vec::new(),
            seq: 0,
            kind: TxKind::Msg,
            context: 0,
            flags: Flags::NONE,
            deadline: now,
            last_send: now,
            resends: 0,
            rnr: false,
            acked: false,
            notify: None,
        })
    }

    fn reset(&mut self) {
        self.packet.clear();
        self.seq = 0;
        self.kind = TxKind::Msg;
        self.context = 0;
        self.flags = Flags::NONE;
        self.resends = 0;
        self.rnr = false;
        self.acked = false;
        self.notify = None;
    }
}

/// Endpoint-wide pool of pre-allocated send descriptors.
pub(crate) struct TxPool {
    free: SegQueue<Box<TxDesc>>,
    total: AtomicUsize,
    leased: AtomicUsize,
}

impl TxPool {
    pub(crate) fn new(count: usize) -> Self {
        let free = SegQueue::new();
        for _ in 0..count {
            free.push(TxDesc::blank());
        }
        Self {
            free,
            total: AtomicUsize::new(count),
            leased: AtomicUsize::new(0),
        }
    }

    pub(crate) fn take(&self) -> Option<Box<TxDesc>> {
        let desc = self.free.pop()?;
        self.leased.fetch_add(1, Ordering::Relaxed);
        Some(desc)
    }

    pub(crate) fn put(&self, mut desc: Box<TxDesc>) {
        desc.reset();
        self.leased.fetch_sub(1, Ordering::Relaxed);
        self.free.push(desc);
    }

    pub(crate) fn free_count(&self) -> usize {
        let total = self.total.load(Ordering::Relaxed);
        total.saturating_sub(self.leased.load(Ordering::Relaxed))
    }

    pub(crate) fn resize(&self, new_total: usize) -> Result<(), Status> {
        let total = self.total.load(Ordering::Relaxed);
        if new_total >= total {
            for _ in 0..new_total - total {
                self.free.push(TxDesc::blank());
            }
            self.total.store(new_total, Ordering::Relaxed);
            return Ok(());
        }
        let mut dropped = 0;
        while dropped < total - new_total {
            if self.free.pop().is_none() {
                // Not enough free descriptors; undo.
                for _ in 0..dropped {
                    self.free.push(TxDesc::blank());
                }
                return Err(Status::Invalid);
            }
            dropped += 1;
        }
        self.total.store(new_total, Ordering::Relaxed);
        Ok(())
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Active side: request sent, awaiting reply.
    Requested,
    /// Passive side: request received, awaiting application accept/reject.
    Passive,
    /// Passive side: reply sent, awaiting the handshake ack (or first
    /// data, which implies it).
    AcceptWait,
    /// Established.
    Ready,
    /// Poisoned by a reliable failure; only `disconnect` remains useful.
    Failed,
}

/// Mutable connection metadata.
pub(crate) struct ConnState {
    pub phase: Phase,
    pub attr: Attribute,
    pub peer: SocketAddr,
    /// Peer's connection ID; 0 until the handshake teaches it.
    pub peer_id: u32,
    /// Application context from `connect` or `accept`.
    pub context: u64,
    pub max_send_size: u32,
    /// Per-connection override of the endpoint send timeout.
    pub send_timeout: Option<Duration>,
    /// Keepalive period; zero = disarmed.
    pub keepalive: Duration,
    pub ka_outstanding: bool,
    pub ka_last_sent: Instant,
    pub last_heard: Instant,
    /// Our initial sequence number, advertised during the handshake.
    pub local_seq_start: u32,
    /// Handshake packet image retransmitted until the exchange completes;
    /// empty when nothing is armed.
    pub hs_packet: Vec<u8>,
    pub hs_deadline: Instant,
    pub hs_last_send: Instant,
    pub hs_resends: u32,
    /// First reliable failure; cascades to every later operation.
    pub failed: Option<Status>,
}

/// Send half of the sliding window.
pub(crate) struct TxSide {
    pub next_seq: u32,
    pub in_flight: VecDeque<Box<TxDesc>>,
    pub queued: VecDeque<Box<TxDesc>>,
}

impl TxSide {
    pub(crate) fn has_window(&self) -> bool {
        self.in_flight.len() < SEND_WINDOW
    }
}

/// Classification of an arriving sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxClass {
    /// At or below the cumulative, or already marked in the bitmap.
    Duplicate,
    /// New, within selective-ACK range; the distance above the cumulative
    /// (1..=32).
    Window(u32),
    /// Beyond the 32-slot window; dropped without acknowledgement.
    Beyond,
}

/// Receive half: cumulative + selective state and the ordered hold queue.
pub(crate) struct RxSide {
    /// Highest contiguously received sequence.
    pub cumulative: u32,
    /// Bitmap of `cumulative+1 ..= cumulative+32`; bit 0 is `cumulative+1`.
    pub received: u32,
    /// Early packets for ordered delivery, sorted by serial order.
    pub hold: Vec<(u32, RxSlot)>,
    pub ack_pending: bool,
    pub last_ack: Instant,
    /// Data packets that raced ahead of the handshake.
    pub deferred: Vec<(crate::wire::Header, Vec<u8>)>,
}

impl RxSide {
    pub(crate) fn new(cumulative: u32) -> Self {
        Self {
            cumulative,
            received: 0,
            hold: Vec::new(),
            ack_pending: false,
            last_ack: Instant::now(),
            deferred: Vec::new(),
        }
    }

    pub(crate) fn classify(&self, seq: u32) -> RxClass {
        let dist = seq.wrapping_sub(self.cumulative);
        if dist as i32 <= 0 {
            return RxClass::Duplicate;
        }
        if dist > 32 {
            return RxClass::Beyond;
        }
        if self.received & (1u32 << (dist - 1)) != 0 {
            RxClass::Duplicate
        } else {
            RxClass::Window(dist)
        }
    }

    /// Record a newly received sequence at `dist` above the cumulative.
    pub(crate) fn mark(&mut self, dist: u32) {
        debug_assert!((1..=32).contains(&dist));
        self.received |= 1u32 << (dist - 1);
    }

    /// Park an early ordered packet. A full hold queue refuses the slot
    /// (handing it back so its lease survives), which poisons the
    /// connection.
    pub(crate) fn insert_hold(&mut self, seq: u32, slot: RxSlot) -> Result<(), RxSlot> {
        if self.hold.len() >= HOLD_LIMIT {
            return Err(slot);
        }
        let pos = self
            .hold
            .iter()
            .position(|(held, _)| crate::wire::seq_lt(seq, *held))
            .unwrap_or(self.hold.len());
        self.hold.insert(pos, (seq, slot));
        Ok(())
    }

    /// Advance the cumulative over every contiguously received sequence,
    /// yielding held payloads in order.
    pub(crate) fn advance(&mut self) -> Vec<RxSlot> {
        let mut delivered = Vec::new();
        while self.received & 1 != 0 {
            self.cumulative = self.cumulative.wrapping_add(1);
            self.received >>= 1;
            if let Some(pos) = self.hold.iter().position(|(seq, _)| *seq == self.cumulative) {
                delivered.push(self.hold.remove(pos).1);
            }
        }
        delivered
    }

    /// Current acknowledgement state for piggyback or standalone ACKs.
    pub(crate) fn ack_fields(&self) -> (u32, u32) {
        (self.cumulative, self.received)
    }

    /// Slide the window forward until `seq` is inside it. An arriving
    /// sequence beyond the 32-slot horizon means the peer abandoned
    /// timed-out sends and moved on; unordered connections forget the
    /// unfillable gap so delivery can continue. (Ordered connections never
    /// get here: the failure cascade poisons them at the first abandoned
    /// send.)
    pub(crate) fn fast_forward(&mut self, seq: u32) {
        while matches!(self.classify(seq), RxClass::Beyond) {
            self.cumulative = self.cumulative.wrapping_add(1);
            self.received >>= 1;
        }
    }
}

/// One connection: metadata plus both window halves plus the RMA queue.
/// The locks are always taken one at a time; the progress engine stages
/// events locally and pushes them after every connection lock is released.
pub(crate) struct Conn {
    pub id: u32,
    pub state: Mutex<ConnState>,
    pub tx: Mutex<TxSide>,
    pub rx: Mutex<RxSide>,
    pub rma: Mutex<RmaQueue>,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        phase: Phase,
        attr: Attribute,
        peer: SocketAddr,
        peer_id: u32,
        context: u64,
        max_send_size: u32,
        local_seq_start: u32,
        peer_seq_start: u32,
    ) -> Arc<Conn> {
        let now = Instant::now();
        Arc::new(Conn {
            id,
            state: Mutex::new(ConnState {
                phase,
                attr,
                peer,
                peer_id,
                context,
                max_send_size,
                send_timeout: None,
                keepalive: Duration::ZERO,
                ka_outstanding: false,
                ka_last_sent: now,
                last_heard: now,
                local_seq_start,
                hs_packet: Vec::new(),
                hs_deadline: now + DEFAULT_CONNECT_TIMEOUT,
                hs_last_send: now,
                hs_resends: 0,
                failed: None,
            }),
            tx: Mutex::new(TxSide {
                next_seq: local_seq_start.wrapping_add(1),
                in_flight: VecDeque::new(),
                queued: VecDeque::new(),
            }),
            rx: Mutex::new(RxSide::new(peer_seq_start)),
            rma: Mutex::new(RmaQueue::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_ceiling() {
        assert_eq!(backoff(0), Duration::from_millis(1));
        assert_eq!(backoff(1), Duration::from_millis(2));
        assert_eq!(backoff(3), Duration::from_millis(8));
        assert_eq!(backoff(20), RETRANS_CEIL);
    }

    #[test]
    fn tx_pool_lease_and_resize() {
        let pool = TxPool::new(2);
        assert_eq!(pool.free_count(), 2);
        let a = pool.take().unwrap();
        let _b = pool.take().unwrap();
        assert!(pool.take().is_none());
        pool.put(a);
        assert_eq!(pool.free_count(), 1);

        pool.resize(3).unwrap();
        assert_eq!(pool.free_count(), 2);
        // One descriptor is still leased; shrinking to zero must fail.
        assert_eq!(pool.resize(0), Err(Status::Invalid));
    }

    #[test]
    fn rx_classification() {
        let rx = RxSide::new(100);
        assert_eq!(rx.classify(100), RxClass::Duplicate);
        assert_eq!(rx.classify(99), RxClass::Duplicate);
        assert_eq!(rx.classify(101), RxClass::Window(1));
        assert_eq!(rx.classify(132), RxClass::Window(32));
        assert_eq!(rx.classify(133), RxClass::Beyond);
    }

    #[test]
    fn rx_marks_and_advances_in_order() {
        let mut rx = RxSide::new(10);
        rx.mark(1);
        let delivered = rx.advance();
        assert!(delivered.is_empty()); // nothing held, just the cursor
        assert_eq!(rx.cumulative, 11);
        assert_eq!(rx.received, 0);
    }

    #[test]
    fn rx_gap_then_fill() {
        let mut rx = RxSide::new(0);
        // Sequence 2 arrives first.
        rx.mark(2);
        assert!(rx.advance().is_empty());
        assert_eq!(rx.cumulative, 0);
        assert_eq!(rx.classify(2), RxClass::Duplicate);

        // Sequence 1 fills the gap; both are consumed.
        rx.mark(1);
        rx.advance();
        assert_eq!(rx.cumulative, 2);
        assert_eq!(rx.received, 0);
    }

    #[test]
    fn rx_works_across_wraparound() {
        let mut rx = RxSide::new(u32::MAX);
        assert_eq!(rx.classify(0), RxClass::Window(1));
        assert_eq!(rx.classify(1), RxClass::Window(2));
        rx.mark(1);
        rx.advance();
        assert_eq!(rx.cumulative, 0);
    }

    #[test]
    fn hold_queue_is_bounded_and_sorted() {
        let mut rx = RxSide::new(0);
        for seq in (2..=10u32).rev() {
            let mut slot = crate::event::test_slot(16);
            slot.fill(&seq.to_be_bytes());
            rx.insert_hold(seq, slot).unwrap();
            rx.mark(seq);
        }
        rx.mark(1);
        let delivered = rx.advance();
        assert_eq!(delivered.len(), 9);
        for (index, slot) in delivered.iter().enumerate() {
            let seq = u32::from_be_bytes(slot.data().try_into().unwrap());
            assert_eq!(seq as usize, index + 2);
        }
    }

    #[test]
    fn fast_forward_skips_abandoned_gap() {
        let mut rx = RxSide::new(0);
        // Sequences 1..=4 arrive, 5..=40 are abandoned by the sender, then
        // sequence 41 shows up from far beyond the window.
        for dist in 1..=4 {
            rx.mark(dist);
        }
        rx.advance();
        assert_eq!(rx.cumulative, 4);
        assert_eq!(rx.classify(41), RxClass::Beyond);

        rx.fast_forward(41);
        assert_eq!(rx.classify(41), RxClass::Window(32));
        rx.mark(32);
        // The forgotten gap is implicitly acknowledged; only 41 is marked.
        assert_eq!(rx.cumulative, 9);
        assert_eq!(rx.received, 1 << 31);
    }

    #[test]
    fn hold_overflow_is_fatal() {
        let mut rx = RxSide::new(0);
        for seq in 2..2 + HOLD_LIMIT as u32 {
            rx.insert_hold(seq, crate::event::test_slot(4)).unwrap();
        }
        assert!(rx.insert_hold(64, crate::event::test_slot(4)).is_err());
    }

    #[test]
    fn notify_completes_once() {
        let notify = TxNotify::new();
        notify.complete(Status::Success);
        notify.complete(Status::TimedOut);
        assert_eq!(notify.wait_while(|| {}), Status::Success);
    }
}
