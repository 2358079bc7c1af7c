//! # RMA Operation State
//!
//! One-sided transfers ride the reliable engine: a WRITE becomes a train of
//! sequenced `RmaWrite` fragments, a READ becomes a train of sequenced
//! `RmaReadRequest` packets each answered by one sequenced `RmaReadReply`.
//! This module holds the per-connection operation queue and its
//! bookkeeping; the progress engine issues fragments from it as window
//! space and TX descriptors allow.

use crate::endpoint::{Flags, RmaRegion};
use crate::status::Status;
use crate::transport::udp::conn::TxNotify;
use crate::wire;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RmaKind {
    Read,
    Write,
}

/// Lifecycle of the optional remote completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionPhase {
    /// Not yet sent (or no message configured and data still moving).
    Pending,
    /// Sent as a reliable message, awaiting acknowledgement.
    InFlight,
    /// Acknowledged (or not configured).
    Done,
}

/// One outstanding RMA operation.
pub(crate) struct RmaOp {
    pub id: u64,
    pub kind: RmaKind,
    pub local: Arc<RmaRegion>,
    pub local_offset: u64,
    pub remote_token: u64,
    pub remote_offset: u64,
    pub len: u64,
    /// Bytes whose fragments have been handed to the send window.
    pub issued: u64,
    /// Fragments in the window awaiting acknowledgement.
    pub outstanding: usize,
    /// Bytes confirmed: acknowledged for writes, received for reads.
    pub done: u64,
    pub completion: Option<Vec<u8>>,
    pub completion_phase: CompletionPhase,
    pub context: u64,
    pub flags: Flags,
    pub deadline: Instant,
    /// First failure; the operation aborts with this status.
    pub failed: Option<Status>,
    pub notify: Option<Arc<TxNotify>>,
}

impl RmaOp {
    pub(crate) fn data_done(&self) -> bool {
        self.done >= self.len
    }

    /// The operation is finished and ready to report: data confirmed, the
    /// completion message (if any) acknowledged, nothing left in flight.
    pub(crate) fn is_complete(&self) -> bool {
        self.failed.is_some()
            || (self.data_done()
                && self.outstanding == 0
                && self.completion_phase == CompletionPhase::Done)
    }

    pub(crate) fn status(&self) -> Status {
        self.failed.unwrap_or(Status::Success)
    }
}

/// A read request served by this side: one reply fragment to generate. The
/// region is re-resolved at send time so a deregistration in between turns
/// into an RMA-handle NACK instead of stale data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadReplyJob {
    /// Local registration the data comes from.
    pub token: u64,
    pub offset: u64,
    pub len: u32,
    /// Where the reply lands at the origin.
    pub origin_token: u64,
    pub origin_offset: u64,
    /// Origin's operation ID, echoed for failure reporting.
    pub op: u64,
}

/// Per-connection RMA state: pending/active operations in issue order plus
/// the backlog of read replies owed to the peer.
pub(crate) struct RmaQueue {
    pub ops: VecDeque<RmaOp>,
    pub replies: VecDeque<ReadReplyJob>,
}

impl RmaQueue {
    pub(crate) fn new() -> Self {
        Self {
            ops: VecDeque::new(),
            replies: VecDeque::new(),
        }
    }

    pub(crate) fn find_mut(&mut self, id: u64) -> Option<&mut RmaOp> {
        self.ops.iter_mut().find(|op| op.id == id)
    }

    /// Latch a failure onto an operation; later fragments stop issuing and
    /// the next progress pass reports it.
    pub(crate) fn fail(&mut self, id: u64, status: Status) {
        if let Some(op) = self.find_mut(id) {
            if op.failed.is_none() {
                op.failed = Some(status);
            }
        }
    }
}

/// Data bytes per WRITE fragment for a given message ceiling.
pub(crate) fn write_fragment_len(max_send_size: u32) -> u32 {
    max_send_size.saturating_sub(wire::RMA_WRITE_HEADER_LEN as u32).max(1)
}

/// Data bytes per READ reply fragment for a given message ceiling.
pub(crate) fn read_fragment_len(max_send_size: u32) -> u32 {
    max_send_size.saturating_sub(wire::RMA_READ_REPLY_LEN as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    fn op(len: u64, completion: Option<Vec<u8>>) -> RmaOp {
        RmaOp {
            id: 1,
            kind: RmaKind::Write,
            local: Arc::new(RmaRegion {
                token: 1,
                protection: Flags::READ,
                buf: RwLock::new(vec![0u8; len as usize].into_boxed_slice()),
            }),
            local_offset: 0,
            remote_token: 2,
            remote_offset: 0,
            len,
            issued: 0,
            outstanding: 0,
            done: 0,
            completion,
            completion_phase: CompletionPhase::Pending,
            context: 0,
            flags: Flags::WRITE,
            deadline: Instant::now(),
            failed: None,
            notify: None,
        }
    }

    #[test]
    fn completion_gates_the_operation() {
        let mut operation = op(10, Some(vec![1, 2, 3]));
        operation.done = 10;
        assert!(operation.data_done());
        assert!(!operation.is_complete());

        operation.completion_phase = CompletionPhase::Done;
        assert!(operation.is_complete());
        assert_eq!(operation.status(), Status::Success);
    }

    #[test]
    fn failure_completes_immediately() {
        let mut operation = op(10, None);
        operation.failed = Some(Status::RmaHandle);
        assert!(operation.is_complete());
        assert_eq!(operation.status(), Status::RmaHandle);
    }

    #[test]
    fn fragment_lengths_account_for_subheaders() {
        assert_eq!(write_fragment_len(8168), 8168 - 24);
        assert_eq!(read_fragment_len(8168), 8168 - 24);
        // Degenerate ceilings still make forward progress.
        assert_eq!(write_fragment_len(8), 1);
    }

    #[test]
    fn queue_failure_latches_once() {
        let mut queue = RmaQueue::new();
        queue.ops.push_back(op(4, None));
        queue.fail(1, Status::RmaHandle);
        queue.fail(1, Status::TimedOut);
        assert_eq!(queue.find_mut(1).unwrap().failed, Some(Status::RmaHandle));
    }
}
