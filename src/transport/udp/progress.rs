//! # Progress Engine
//!
//! A single non-blocking pass over the endpoint's work: drain arriving
//! datagrams, process acknowledgements, retransmit due descriptors, emit
//! delayed ACKs, tick keepalives, and expire handshake and send timers.
//! The pass runs under callers inside `get_event` and `send`, and on the
//! optional helper thread started at endpoint creation.
//!
//! Passes are serialised by a try-lock: a caller finding another pass in
//! flight simply skips, which keeps the engine non-blocking by
//! construction. Events produced while connection locks are held are
//! staged into a local vector and published after every lock is released.

use super::conn::{backoff, Conn, Phase, RxClass, TxDesc, TxKind, ACK_DELAY, DEFER_LIMIT};
use super::rma::{
    read_fragment_len, write_fragment_len, CompletionPhase, ReadReplyJob, RmaKind, RmaOp,
};
use super::UdpEndpoint;
use crate::endpoint::{checked_range, Attribute, Flags};
use crate::event::{EventInner, EventKind};
use crate::status::Status;
use crate::wire::{
    seq_le, Header, PacketType, RmaReadReply, RmaReadRequest, RmaWriteHeader, NACK_RMA_HANDLE,
    NACK_RNR, RMA_READ_REPLY_LEN, RMA_READ_REQUEST_LEN, RMA_WRITE_HEADER_LEN,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

type Staged = Vec<Box<EventInner>>;

/// Datagrams drained per pass; bounds the time one pass can hold the
/// progress lock under a flood.
const DRAIN_BUDGET: usize = 1024;

/// Helper-thread poll interval when the socket is quiet.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Start the optional progress helper thread. The thread holds only a weak
/// reference, so dropping the last endpoint handle ends it.
pub(super) fn spawn(
    weak: Weak<UdpEndpoint>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, Status> {
    thread::Builder::new()
        .name("cci-udp-progress".into())
        .spawn(move || loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let Some(endpoint) = weak.upgrade() else { break };
            endpoint.wait_for_socket(IDLE_POLL);
            endpoint.progress();
        })
        .map_err(|_| Status::NoMemory)
}

enum ReplyOutcome {
    Sent,
    NoDescriptor,
    BadRegion,
}

impl UdpEndpoint {
    /// Block the helper thread until the socket is readable or `timeout`
    /// elapses. Callers never enter here; progress itself stays
    /// non-blocking.
    pub(super) fn wait_for_socket(&self, timeout: Duration) {
        let mut fds = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut fds, 1, timeout.as_millis() as libc::c_int) };
    }

    /// One full progress pass. Re-entrant callers skip instead of queueing.
    pub(crate) fn progress(&self) {
        let Some(_guard) = self.progress_mutex.try_lock() else {
            return;
        };
        let mut staged: Staged = Vec::new();
        self.drain_socket(&mut staged);
        self.service_connections(&mut staged);
        self.publish(staged);
    }

    fn drain_socket(&self, staged: &mut Staged) {
        let mut buf = [0u8; 65600];
        for _ in 0..DRAIN_BUDGET {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => match Header::decode(&buf[..len]) {
                    Ok((header, payload)) => self.handle_packet(header, payload, from, staged),
                    Err(_) => trace!(%from, len, "dropping undecodable datagram"),
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                // Queued ICMP errors from earlier sends surface here on
                // Linux; they are not fatal for the socket.
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionRefused | ErrorKind::Interrupted
                    ) =>
                {
                    trace!(%err, "transient socket error");
                }
                Err(err) => {
                    if !self.device_failed.swap(true, Ordering::AcqRel) {
                        warn!(%err, "device failed");
                        staged.push(EventInner::new(EventKind::EndpointDeviceFailed));
                    }
                    break;
                }
            }
        }
    }

    fn handle_packet(
        &self,
        header: Header,
        payload: &[u8],
        from: SocketAddr,
        staged: &mut Staged,
    ) {
        if header.kind == PacketType::ConnRequest {
            return self.on_conn_request(header, payload, from, staged);
        }
        let conn = match self.conns.read().get(&header.dst).cloned() {
            Some(conn) => conn,
            None => {
                if header.kind == PacketType::Msg && header.dst == 0 {
                    self.on_multicast(payload, staged);
                } else {
                    trace!(dst = header.dst, kind = ?header.kind, "packet for unknown connection");
                }
                return;
            }
        };
        {
            let mut state = conn.state.lock();
            if state.peer != from {
                warn!(conn = conn.id, %from, "source address mismatch; dropping");
                return;
            }
            state.last_heard = Instant::now();
        }
        match header.kind {
            PacketType::ConnReply => self.on_conn_reply(&conn, header, staged),
            PacketType::ConnReject => self.on_conn_reject(&conn, staged),
            PacketType::ConnAck => self.on_conn_ack(&conn, staged),
            PacketType::Ack => self.process_acks(&conn, header.ack, header.sack, staged),
            PacketType::Nack => self.on_nack(&conn, header, payload),
            PacketType::Keepalive => {
                self.process_acks(&conn, header.ack, header.sack, staged);
                // Answer promptly so an idle peer sees liveness within its
                // period.
                let reliable = conn.state.lock().attr.is_reliable();
                if reliable {
                    conn.rx.lock().ack_pending = true;
                }
            }
            PacketType::Msg
            | PacketType::RmaWrite
            | PacketType::RmaReadRequest
            | PacketType::RmaReadReply => self.on_data(&conn, header, payload, staged),
            PacketType::ConnRequest => unreachable!("handled above"),
        }
    }

    fn on_conn_request(
        &self,
        header: Header,
        payload: &[u8],
        from: SocketAddr,
        staged: &mut Staged,
    ) {
        let Ok(attr) = Attribute::from_wire(header.aux) else {
            return;
        };
        if attr.is_multicast() {
            return;
        }
        let key = (from, header.src);
        let existing = self.peers.lock().get(&key).copied();
        if let Some(existing) = existing {
            if let Ok(conn) = self.lookup(existing) {
                let (phase, packet, peer) = {
                    let state = conn.state.lock();
                    (state.phase, state.hs_packet.clone(), state.peer)
                };
                if phase == Phase::AcceptWait && !packet.is_empty() {
                    // Our reply was lost; repeat it.
                    self.transmit(peer, &packet);
                }
            }
            return;
        }
        let Some(mut slot) = self.rx_pool.take() else {
            trace!(%from, "no RX slot for connection request; dropping");
            return;
        };
        slot.fill(payload);
        let id = match self.alloc_conn_id() {
            Some(id) => id,
            None => {
                self.rx_pool.put(slot);
                return;
            }
        };
        let conn = Conn::new(
            id,
            Phase::Passive,
            attr,
            from,
            header.src,
            0,
            self.max_send_size,
            rand::random(),
            header.seq,
        );
        self.conns.write().insert(id, conn);
        self.peers.lock().insert(key, id);
        let mut inner = EventInner::with_slot(EventKind::ConnectRequest { attribute: attr }, slot);
        inner.request = Some(id);
        staged.push(inner);
        debug!(conn = id, %from, ?attr, "connection request received");
    }

    fn on_conn_reply(&self, conn: &Arc<Conn>, header: Header, staged: &mut Staged) {
        let mut connect_context = None;
        let peer;
        {
            let mut state = conn.state.lock();
            peer = state.peer;
            match state.phase {
                Phase::Requested => {
                    state.peer_id = header.src;
                    state.phase = Phase::Ready;
                    state.hs_packet.clear();
                    connect_context = Some(state.context);
                }
                // Duplicate reply: our handshake ack was lost. Re-ack below.
                Phase::Ready => {}
                _ => return,
            }
        }
        if connect_context.is_some() {
            conn.rx.lock().cumulative = header.seq;
        }
        let ack = conn.rx.lock().ack_fields();
        self.send_control(peer, PacketType::ConnAck, 0, conn.id, header.src, 0, ack, &[]);
        if let Some(context) = connect_context {
            staged.push(EventInner::new(EventKind::Connect {
                status: Status::Success,
                context,
                connection: Some(self.conn_handle(conn.id)),
            }));
            debug!(conn = conn.id, "connection established");
        }
    }

    fn on_conn_reject(&self, conn: &Arc<Conn>, staged: &mut Staged) {
        let context = {
            let state = conn.state.lock();
            if state.phase != Phase::Requested {
                return;
            }
            state.context
        };
        self.remove_conn(conn.id);
        staged.push(EventInner::new(EventKind::Connect {
            status: Status::ConnRefused,
            context,
            connection: None,
        }));
        debug!(conn = conn.id, "connection refused by peer");
    }

    fn on_conn_ack(&self, conn: &Arc<Conn>, staged: &mut Staged) {
        let context = {
            let mut state = conn.state.lock();
            if state.phase != Phase::AcceptWait {
                return;
            }
            state.phase = Phase::Ready;
            state.hs_packet.clear();
            state.context
        };
        staged.push(EventInner::new(EventKind::Accept {
            status: Status::Success,
            context,
            connection: Some(self.conn_handle(conn.id)),
        }));
        debug!(conn = conn.id, "accept completed");
        self.flush_deferred(conn, staged);
    }

    /// Replay data packets that raced ahead of the handshake.
    fn flush_deferred(&self, conn: &Arc<Conn>, staged: &mut Staged) {
        let deferred: Vec<_> = conn.rx.lock().deferred.drain(..).collect();
        for (header, payload) in deferred {
            self.on_data(conn, header, &payload, staged);
        }
    }

    fn on_nack(&self, conn: &Arc<Conn>, header: Header, payload: &[u8]) {
        match header.aux {
            NACK_RNR => {
                let mut tx = conn.tx.lock();
                if let Some(desc) = tx.in_flight.iter_mut().find(|d| d.seq == header.seq) {
                    desc.rnr = true;
                }
                trace!(conn = conn.id, seq = header.seq, "peer out of receive buffers");
            }
            NACK_RMA_HANDLE => {
                let mut cursor = payload;
                if let Ok(op) = cursor.read_u64::<BigEndian>() {
                    conn.rma.lock().fail(op, Status::RmaHandle);
                    warn!(conn = conn.id, op, "remote refused RMA handle");
                }
            }
            other => trace!(aux = other, "unknown NACK kind"),
        }
    }

    fn on_data(&self, conn: &Arc<Conn>, header: Header, payload: &[u8], staged: &mut Staged) {
        let (phase, attr) = {
            let state = conn.state.lock();
            (state.phase, state.attr)
        };
        match phase {
            Phase::Passive => {
                // Data ahead of accept(); park it until the application
                // decides.
                let mut rx = conn.rx.lock();
                if rx.deferred.len() < DEFER_LIMIT {
                    rx.deferred.push((header, payload.to_vec()));
                }
                return;
            }
            Phase::AcceptWait => {
                // Data implies the peer saw our reply: implicit acceptance.
                let context = {
                    let mut state = conn.state.lock();
                    state.phase = Phase::Ready;
                    state.hs_packet.clear();
                    state.context
                };
                staged.push(EventInner::new(EventKind::Accept {
                    status: Status::Success,
                    context,
                    connection: Some(self.conn_handle(conn.id)),
                }));
                debug!(conn = conn.id, "accept completed implicitly by data");
                self.flush_deferred(conn, staged);
            }
            Phase::Ready => {}
            _ => return,
        }

        if !attr.is_reliable() {
            if header.kind == PacketType::Msg {
                let Some(mut slot) = self.rx_pool.take() else {
                    return;
                };
                slot.fill(payload);
                staged.push(EventInner::with_slot(
                    EventKind::Recv {
                        connection: self.conn_handle(conn.id),
                    },
                    slot,
                ));
            }
            return;
        }

        self.process_acks(conn, header.ack, header.sack, staged);
        match header.kind {
            PacketType::Msg => self.on_reliable_msg(conn, attr, header, payload, staged),
            PacketType::RmaWrite => self.on_rma_write(conn, header, payload, staged),
            PacketType::RmaReadRequest => self.on_rma_read_request(conn, header, payload, staged),
            PacketType::RmaReadReply => self.on_rma_read_reply(conn, header, payload, staged),
            _ => {}
        }
    }

    fn on_reliable_msg(
        &self,
        conn: &Arc<Conn>,
        attr: Attribute,
        header: Header,
        payload: &[u8],
        staged: &mut Staged,
    ) {
        let (peer, peer_id) = {
            let state = conn.state.lock();
            (state.peer, state.peer_id)
        };
        let mut rx = conn.rx.lock();
        if attr == Attribute::Ru {
            rx.fast_forward(header.seq);
        }
        match rx.classify(header.seq) {
            RxClass::Duplicate => {
                rx.ack_pending = true;
            }
            RxClass::Beyond => {}
            RxClass::Window(dist) => {
                let Some(mut slot) = self.rx_pool.take() else {
                    let ack = rx.ack_fields();
                    drop(rx);
                    trace!(conn = conn.id, seq = header.seq, "receive pool empty; RNR");
                    self.send_control(
                        peer,
                        PacketType::Nack,
                        NACK_RNR,
                        conn.id,
                        peer_id,
                        header.seq,
                        ack,
                        &[],
                    );
                    return;
                };
                slot.fill(payload);
                rx.mark(dist);
                rx.ack_pending = true;
                if attr == Attribute::Ru {
                    // Unordered: dispatch immediately, the bitmap suppresses
                    // duplicates until the hole fills.
                    rx.advance();
                    drop(rx);
                    staged.push(EventInner::with_slot(
                        EventKind::Recv {
                            connection: self.conn_handle(conn.id),
                        },
                        slot,
                    ));
                } else if dist == 1 {
                    let flushed = rx.advance();
                    drop(rx);
                    staged.push(EventInner::with_slot(
                        EventKind::Recv {
                            connection: self.conn_handle(conn.id),
                        },
                        slot,
                    ));
                    for held in flushed {
                        staged.push(EventInner::with_slot(
                            EventKind::Recv {
                                connection: self.conn_handle(conn.id),
                            },
                            held,
                        ));
                    }
                } else if let Err(slot) = rx.insert_hold(header.seq, slot) {
                    drop(rx);
                    self.rx_pool.put(slot);
                    warn!(conn = conn.id, "reorder hold overflow; failing connection");
                    self.fail_conn(conn, Status::Generic, staged);
                }
            }
        }
    }

    fn on_rma_write(&self, conn: &Arc<Conn>, header: Header, payload: &[u8], staged: &mut Staged) {
        let Ok((sub, data)) = RmaWriteHeader::decode(payload) else {
            return;
        };
        if !self.note_rma_sequence(conn, header.seq, staged) {
            return;
        }
        if !self.apply_remote_write(sub.token, sub.offset, data) {
            self.send_rma_nack(conn, sub.op);
        }
    }

    fn on_rma_read_request(
        &self,
        conn: &Arc<Conn>,
        header: Header,
        payload: &[u8],
        staged: &mut Staged,
    ) {
        if payload.len() != RMA_READ_REQUEST_LEN {
            return;
        }
        let Ok(req) = RmaReadRequest::decode(payload) else {
            return;
        };
        if !self.note_rma_sequence(conn, header.seq, staged) {
            return;
        }
        if self.validate_read_source(req.token, req.offset, req.length) {
            conn.rma.lock().replies.push_back(ReadReplyJob {
                token: req.token,
                offset: req.offset,
                len: req.length,
                origin_token: req.origin_token,
                origin_offset: req.origin_offset,
                op: req.op,
            });
        } else {
            self.send_rma_nack(conn, req.op);
        }
    }

    fn on_rma_read_reply(
        &self,
        conn: &Arc<Conn>,
        header: Header,
        payload: &[u8],
        staged: &mut Staged,
    ) {
        let Ok((sub, data)) = RmaReadReply::decode(payload) else {
            return;
        };
        if !self.note_rma_sequence(conn, header.seq, staged) {
            return;
        }
        let region = self.rma_regions.read().get(&sub.origin_token).cloned();
        let Some(region) = region else {
            // Deregistered while the read was in flight; the local
            // operation was already aborted.
            return;
        };
        {
            let mut buf = region.buf.write();
            let Ok(range) = checked_range(sub.origin_offset, data.len() as u64, buf.len() as u64)
            else {
                return;
            };
            buf[range].copy_from_slice(data);
        }
        let mut rma = conn.rma.lock();
        if let Some(op) = rma.find_mut(sub.op) {
            op.done += data.len() as u64;
        }
    }

    /// Sequence bookkeeping shared by the RMA packet types: duplicates are
    /// re-acknowledged and dropped, new arrivals advance the window and may
    /// release held ordered messages. Returns whether the packet is new.
    fn note_rma_sequence(&self, conn: &Arc<Conn>, seq: u32, staged: &mut Staged) -> bool {
        let attr = conn.state.lock().attr;
        let mut rx = conn.rx.lock();
        if attr == Attribute::Ru {
            rx.fast_forward(seq);
        }
        match rx.classify(seq) {
            RxClass::Duplicate => {
                rx.ack_pending = true;
                false
            }
            RxClass::Beyond => false,
            RxClass::Window(dist) => {
                rx.mark(dist);
                rx.ack_pending = true;
                let flushed = rx.advance();
                drop(rx);
                for held in flushed {
                    staged.push(EventInner::with_slot(
                        EventKind::Recv {
                            connection: self.conn_handle(conn.id),
                        },
                        held,
                    ));
                }
                true
            }
        }
    }

    fn apply_remote_write(&self, token: u64, offset: u64, data: &[u8]) -> bool {
        let Some(region) = self.rma_regions.read().get(&token).cloned() else {
            return false;
        };
        if !region.protection.contains(Flags::WRITE) {
            return false;
        }
        let mut buf = region.buf.write();
        match checked_range(offset, data.len() as u64, buf.len() as u64) {
            Ok(range) => {
                buf[range].copy_from_slice(data);
                true
            }
            Err(_) => false,
        }
    }

    fn validate_read_source(&self, token: u64, offset: u64, len: u32) -> bool {
        let Some(region) = self.rma_regions.read().get(&token).cloned() else {
            return false;
        };
        region.protection.contains(Flags::READ)
            && checked_range(offset, len as u64, region.len()).is_ok()
    }

    fn send_rma_nack(&self, conn: &Arc<Conn>, op: u64) {
        let (peer, peer_id) = {
            let state = conn.state.lock();
            (state.peer, state.peer_id)
        };
        let ack = conn.rx.lock().ack_fields();
        let mut payload = Vec::with_capacity(8);
        let _ = payload.write_u64::<BigEndian>(op);
        self.send_control(
            peer,
            PacketType::Nack,
            NACK_RMA_HANDLE,
            conn.id,
            peer_id,
            0,
            ack,
            &payload,
        );
    }

    fn on_multicast(&self, payload: &[u8], staged: &mut Staged) {
        let Some(id) = *self.mc_rx.lock() else {
            return;
        };
        let Ok(conn) = self.lookup(id) else {
            return;
        };
        let Some(mut slot) = self.rx_pool.take() else {
            return;
        };
        slot.fill(payload);
        staged.push(EventInner::with_slot(
            EventKind::Recv {
                connection: self.conn_handle(conn.id),
            },
            slot,
        ));
    }

    /// Apply a cumulative + selective acknowledgement to the send window,
    /// complete descriptors (in send order on ordered connections), and
    /// promote queued descriptors into the freed window.
    pub(super) fn process_acks(
        &self,
        conn: &Arc<Conn>,
        ack: u32,
        sack: u32,
        staged: &mut Staged,
    ) {
        let (attr, peer) = {
            let state = conn.state.lock();
            (state.attr, state.peer)
        };
        if !attr.is_reliable() {
            return;
        }
        let ack_now = conn.rx.lock().ack_fields();
        let mut completions: Vec<Box<TxDesc>> = Vec::new();
        {
            let mut tx = conn.tx.lock();
            for desc in tx.in_flight.iter_mut() {
                if desc.acked {
                    continue;
                }
                if seq_le(desc.seq, ack) {
                    desc.acked = true;
                    continue;
                }
                let dist = desc.seq.wrapping_sub(ack);
                if (1..=32).contains(&dist) && sack & (1u32 << (dist - 1)) != 0 {
                    desc.acked = true;
                }
            }
            if attr == Attribute::Ro {
                // Ordered completions: only a fully-acked prefix may
                // complete, in send order.
                while tx.in_flight.front().map_or(false, |desc| desc.acked) {
                    completions.push(tx.in_flight.pop_front().unwrap());
                }
            } else {
                let mut index = 0;
                while index < tx.in_flight.len() {
                    if tx.in_flight[index].acked {
                        completions.push(tx.in_flight.remove(index).unwrap());
                    } else {
                        index += 1;
                    }
                }
            }
            let now = Instant::now();
            while tx.has_window() {
                let Some(mut desc) = tx.queued.pop_front() else { break };
                Header::patch_ack(&mut desc.packet, ack_now.0, ack_now.1);
                desc.last_send = now;
                self.transmit(peer, &desc.packet);
                tx.in_flight.push_back(desc);
            }
        }
        for desc in completions {
            self.complete_tx(conn, desc, Status::Success, staged);
        }
    }

    fn service_connections(&self, staged: &mut Staged) {
        let now = Instant::now();
        let conns: Vec<Arc<Conn>> = self.conns.read().values().cloned().collect();
        for conn in conns {
            self.service_conn(&conn, now, staged);
        }
    }

    fn service_conn(&self, conn: &Arc<Conn>, now: Instant, staged: &mut Staged) {
        // Handshake retransmit / expiry plus the keepalive state machine.
        let mut resend: Option<(Vec<u8>, SocketAddr)> = None;
        let mut probe: Option<(SocketAddr, u32)> = None;
        let mut expired: Option<Phase> = None;
        let mut keepalive_fired = false;
        {
            let mut state = conn.state.lock();
            match state.phase {
                Phase::Requested | Phase::AcceptWait => {
                    if now >= state.hs_deadline {
                        expired = Some(state.phase);
                    } else if !state.hs_packet.is_empty()
                        && now >= state.hs_last_send + backoff(state.hs_resends)
                    {
                        resend = Some((state.hs_packet.clone(), state.peer));
                        state.hs_last_send = now;
                        state.hs_resends += 1;
                    }
                }
                Phase::Ready
                    if state.attr.is_reliable() && state.keepalive > Duration::ZERO =>
                {
                    if now.duration_since(state.last_heard) >= state.keepalive {
                        if !state.ka_outstanding {
                            state.ka_outstanding = true;
                            state.ka_last_sent = now;
                            probe = Some((state.peer, state.peer_id));
                        } else if now.duration_since(state.ka_last_sent) >= state.keepalive {
                            // One event per arming; re-arm via the option.
                            state.keepalive = Duration::ZERO;
                            state.ka_outstanding = false;
                            keepalive_fired = true;
                        }
                    } else {
                        state.ka_outstanding = false;
                    }
                }
                _ => {}
            }
        }
        if let Some((packet, peer)) = resend {
            self.transmit(peer, &packet);
        }
        if let Some(phase) = expired {
            let context = conn.state.lock().context;
            let kind = match phase {
                Phase::Requested => EventKind::Connect {
                    status: Status::TimedOut,
                    context,
                    connection: None,
                },
                _ => EventKind::Accept {
                    status: Status::TimedOut,
                    context,
                    connection: None,
                },
            };
            staged.push(EventInner::new(kind));
            debug!(conn = conn.id, "handshake timed out");
            self.remove_conn(conn.id);
            return;
        }
        if let Some((peer, peer_id)) = probe {
            let ack = conn.rx.lock().ack_fields();
            self.send_control(peer, PacketType::Keepalive, 0, conn.id, peer_id, 0, ack, &[]);
            trace!(conn = conn.id, "keepalive probe sent");
        }
        if keepalive_fired {
            staged.push(EventInner::new(EventKind::KeepaliveTimedOut {
                connection: self.conn_handle(conn.id),
            }));
            debug!(conn = conn.id, "keepalive timed out");
        }

        let (attr, peer, peer_id) = {
            let state = conn.state.lock();
            (state.attr, state.peer, state.peer_id)
        };
        if !attr.is_reliable() {
            return;
        }

        // Retransmit due descriptors, expire dead ones.
        let ack_now = conn.rx.lock().ack_fields();
        let mut failures: Vec<(Box<TxDesc>, Status)> = Vec::new();
        let mut poison: Option<Status> = None;
        {
            let mut tx = conn.tx.lock();
            let mut index = 0;
            while index < tx.in_flight.len() {
                if tx.in_flight[index].acked {
                    index += 1;
                    continue;
                }
                if now >= tx.in_flight[index].deadline {
                    let desc = tx.in_flight.remove(index).unwrap();
                    let status = if desc.rnr { Status::Rnr } else { Status::TimedOut };
                    failures.push((desc, status));
                    if attr == Attribute::Ro {
                        poison = Some(status);
                        break;
                    }
                } else {
                    let desc = &mut tx.in_flight[index];
                    if now >= desc.last_send + backoff(desc.resends) {
                        Header::patch_ack(&mut desc.packet, ack_now.0, ack_now.1);
                        self.transmit(peer, &desc.packet);
                        desc.resends += 1;
                        desc.last_send = now;
                    }
                    index += 1;
                }
            }
            if poison.is_none() {
                while tx.has_window() {
                    let Some(mut desc) = tx.queued.pop_front() else { break };
                    Header::patch_ack(&mut desc.packet, ack_now.0, ack_now.1);
                    desc.last_send = now;
                    self.transmit(peer, &desc.packet);
                    tx.in_flight.push_back(desc);
                }
            }
        }
        for (desc, status) in failures {
            self.complete_tx(conn, desc, status, staged);
        }
        if let Some(status) = poison {
            warn!(conn = conn.id, %status, "send failed; poisoning ordered connection");
            self.fail_conn(conn, status, staged);
            return;
        }

        self.service_rma(conn, peer, peer_id, now, staged);

        // Standalone delayed ACK, at most one per ACK_DELAY per connection.
        let mut ack_to_send = None;
        {
            let mut rx = conn.rx.lock();
            if rx.ack_pending && now.duration_since(rx.last_ack) >= ACK_DELAY {
                rx.ack_pending = false;
                rx.last_ack = now;
                ack_to_send = Some(rx.ack_fields());
            }
        }
        if let Some(ack) = ack_to_send {
            self.send_control(peer, PacketType::Ack, 0, conn.id, peer_id, 0, ack, &[]);
        }
    }

    /// Serve owed read replies, issue operation fragments in fence order,
    /// time out and harvest finished operations.
    fn service_rma(
        &self,
        conn: &Arc<Conn>,
        peer: SocketAddr,
        peer_id: u32,
        now: Instant,
        staged: &mut Staged,
    ) {
        let ack_now = conn.rx.lock().ack_fields();
        let mut nacks: Vec<u64> = Vec::new();
        let mut done: Vec<RmaOp> = Vec::new();
        {
            let mut rma = conn.rma.lock();
            while let Some(job) = rma.replies.front().copied() {
                match self.push_read_reply(conn, peer, peer_id, &job, now, ack_now) {
                    ReplyOutcome::Sent => {
                        rma.replies.pop_front();
                    }
                    ReplyOutcome::NoDescriptor => break,
                    ReplyOutcome::BadRegion => {
                        rma.replies.pop_front();
                        nacks.push(job.op);
                    }
                }
            }
            for index in 0..rma.ops.len() {
                let fence = rma.ops[index].flags.contains(Flags::FENCE);
                // A fenced operation waits for everything before it.
                if fence && index > 0 {
                    break;
                }
                let incomplete = {
                    let op = &mut rma.ops[index];
                    if op.failed.is_none() && now >= op.deadline && !op.is_complete() {
                        op.failed = Some(Status::TimedOut);
                    }
                    if op.failed.is_none() {
                        self.issue_fragments(conn, peer, peer_id, op, now, ack_now);
                    }
                    !op.is_complete()
                };
                // Nothing after an incomplete fence may issue.
                if fence && incomplete {
                    break;
                }
            }
            for op in rma.ops.iter_mut() {
                if op.failed.is_none() && now >= op.deadline && !op.is_complete() {
                    op.failed = Some(Status::TimedOut);
                }
            }
            let mut index = 0;
            while index < rma.ops.len() {
                if rma.ops[index].is_complete() {
                    done.push(rma.ops.remove(index).unwrap());
                } else {
                    index += 1;
                }
            }
        }
        for op in nacks {
            let mut payload = Vec::with_capacity(8);
            let _ = payload.write_u64::<BigEndian>(op);
            self.send_control(
                peer,
                PacketType::Nack,
                NACK_RMA_HANDLE,
                conn.id,
                peer_id,
                0,
                ack_now,
                &payload,
            );
        }
        for op in done {
            trace!(conn = conn.id, op = op.id, status = %op.status(), "RMA operation finished");
            self.finish_rma_op(conn, op, staged);
        }
    }

    fn push_read_reply(
        &self,
        conn: &Arc<Conn>,
        peer: SocketAddr,
        peer_id: u32,
        job: &ReadReplyJob,
        now: Instant,
        ack: (u32, u32),
    ) -> ReplyOutcome {
        let Some(region) = self.rma_regions.read().get(&job.token).cloned() else {
            return ReplyOutcome::BadRegion;
        };
        if !region.protection.contains(Flags::READ) {
            return ReplyOutcome::BadRegion;
        }
        let data = {
            let buf = region.buf.read();
            match checked_range(job.offset, job.len as u64, buf.len() as u64) {
                Ok(range) => buf[range].to_vec(),
                Err(_) => return ReplyOutcome::BadRegion,
            }
        };
        let Some(mut desc) = self.tx_pool.take() else {
            return ReplyOutcome::NoDescriptor;
        };
        desc.kind = TxKind::RmaReadReply;
        desc.flags = Flags::SILENT;
        desc.deadline = now + self.opts.lock().send_timeout;
        let sub = RmaReadReply {
            origin_token: job.origin_token,
            origin_offset: job.origin_offset,
            op: job.op,
        };
        let mut tx = conn.tx.lock();
        let seq = tx.next_seq;
        tx.next_seq = seq.wrapping_add(1);
        desc.seq = seq;
        desc.packet.clear();
        Header {
            kind: PacketType::RmaReadReply,
            aux: 0,
            src: conn.id,
            dst: peer_id,
            seq,
            ack: ack.0,
            sack: ack.1,
            len: (RMA_READ_REPLY_LEN + data.len()) as u16,
        }
        .write_to(&mut desc.packet);
        sub.write_to(&mut desc.packet);
        desc.packet.extend_from_slice(&data);
        if tx.has_window() {
            desc.last_send = now;
            self.transmit(peer, &desc.packet);
            tx.in_flight.push_back(desc);
        } else {
            tx.queued.push_back(desc);
        }
        ReplyOutcome::Sent
    }

    /// Issue as many fragments of one operation as window space and the TX
    /// pool allow, and dispatch the completion message once the data is
    /// remotely confirmed.
    fn issue_fragments(
        &self,
        conn: &Arc<Conn>,
        peer: SocketAddr,
        peer_id: u32,
        op: &mut RmaOp,
        now: Instant,
        ack: (u32, u32),
    ) {
        let fragment = match op.kind {
            RmaKind::Write => write_fragment_len(self.max_send_size) as u64,
            RmaKind::Read => read_fragment_len(self.max_send_size) as u64,
        };
        while op.issued < op.len {
            let Some(mut desc) = self.tx_pool.take() else { break };
            let take = fragment.min(op.len - op.issued);
            desc.flags = Flags::SILENT;
            desc.deadline = op.deadline;
            match op.kind {
                RmaKind::Write => {
                    let data = {
                        let buf = op.local.buf.read();
                        match checked_range(op.local_offset + op.issued, take, buf.len() as u64) {
                            Ok(range) => buf[range].to_vec(),
                            Err(_) => {
                                // Region shrank underneath us (deregister).
                                self.tx_pool.put(desc);
                                op.failed = Some(Status::Disconnected);
                                return;
                            }
                        }
                    };
                    desc.kind = TxKind::RmaWrite {
                        op: op.id,
                        bytes: take as u32,
                    };
                    let sub = RmaWriteHeader {
                        token: op.remote_token,
                        offset: op.remote_offset + op.issued,
                        op: op.id,
                    };
                    let mut tx = conn.tx.lock();
                    if !tx.has_window() {
                        drop(tx);
                        self.tx_pool.put(desc);
                        return;
                    }
                    let seq = tx.next_seq;
                    tx.next_seq = seq.wrapping_add(1);
                    desc.seq = seq;
                    desc.packet.clear();
                    Header {
                        kind: PacketType::RmaWrite,
                        aux: 0,
                        src: conn.id,
                        dst: peer_id,
                        seq,
                        ack: ack.0,
                        sack: ack.1,
                        len: (RMA_WRITE_HEADER_LEN + data.len()) as u16,
                    }
                    .write_to(&mut desc.packet);
                    sub.write_to(&mut desc.packet);
                    desc.packet.extend_from_slice(&data);
                    desc.last_send = now;
                    self.transmit(peer, &desc.packet);
                    tx.in_flight.push_back(desc);
                }
                RmaKind::Read => {
                    desc.kind = TxKind::RmaReadRequest { op: op.id };
                    let req = RmaReadRequest {
                        token: op.remote_token,
                        offset: op.remote_offset + op.issued,
                        length: take as u32,
                        origin_token: op.local.token,
                        origin_offset: op.local_offset + op.issued,
                        op: op.id,
                    };
                    let mut tx = conn.tx.lock();
                    if !tx.has_window() {
                        drop(tx);
                        self.tx_pool.put(desc);
                        return;
                    }
                    let seq = tx.next_seq;
                    tx.next_seq = seq.wrapping_add(1);
                    desc.seq = seq;
                    desc.packet.clear();
                    Header {
                        kind: PacketType::RmaReadRequest,
                        aux: 0,
                        src: conn.id,
                        dst: peer_id,
                        seq,
                        ack: ack.0,
                        sack: ack.1,
                        len: RMA_READ_REQUEST_LEN as u16,
                    }
                    .write_to(&mut desc.packet);
                    req.write_to(&mut desc.packet);
                    desc.last_send = now;
                    self.transmit(peer, &desc.packet);
                    tx.in_flight.push_back(desc);
                }
            }
            op.issued += take;
            op.outstanding += 1;
        }

        if op.data_done() && op.completion_phase == CompletionPhase::Pending {
            match op.completion.clone() {
                Some(message) => {
                    let Some(mut desc) = self.tx_pool.take() else { return };
                    desc.kind = TxKind::RmaCompletion { op: op.id };
                    desc.flags = Flags::SILENT;
                    desc.deadline = op.deadline;
                    let mut tx = conn.tx.lock();
                    let seq = tx.next_seq;
                    tx.next_seq = seq.wrapping_add(1);
                    desc.seq = seq;
                    desc.packet.clear();
                    Header {
                        kind: PacketType::Msg,
                        aux: 0,
                        src: conn.id,
                        dst: peer_id,
                        seq,
                        ack: ack.0,
                        sack: ack.1,
                        len: message.len() as u16,
                    }
                    .write_to(&mut desc.packet);
                    desc.packet.extend_from_slice(&message);
                    if tx.has_window() {
                        desc.last_send = now;
                        self.transmit(peer, &desc.packet);
                        tx.in_flight.push_back(desc);
                    } else {
                        tx.queued.push_back(desc);
                    }
                    op.completion_phase = CompletionPhase::InFlight;
                }
                None => op.completion_phase = CompletionPhase::Done,
            }
        }
    }
}
