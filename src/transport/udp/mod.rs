//! # Reference Unreliable-Datagram Transport
//!
//! The UDP transport implements the full connection, reliability, RMA and
//! event semantics over plain datagrams. It is the reference for the
//! plugin contract: a hardware transport would swap the socket layer and
//! keep everything else.
//!
//! ## Endpoint anatomy
//!
//! One non-blocking UDP socket per endpoint carries every connection. The
//! endpoint owns the TX descriptor pool, the RX slot pool, the connection
//! table (keyed by local connection ID), the RMA registration table, and
//! the ready-event queue with its wake pipe. A progress helper thread is
//! started by default and can be disabled per device with
//! `progress = poll`, in which case callers drive progress from
//! `get_event` and `send`.

mod conn;
mod progress;
mod rma;

use crate::config::DeviceProfile;
use crate::device::Device;
use crate::endpoint::{
    self, Attribute, ConnectionOption, EndpointOption, Flags, OptValue, RmaHandle, RmaRegion,
    RmaRemoteHandle, WakeHandle,
};
use crate::event::{Event, EventInner, EventKind, EventQueue, SlotPool};
use crate::id_pool::IdPool;
use crate::status::{Result, Status};
use crate::transport::{EndpointOps, Transport, TransportCaps};
use crate::wire::{self, Header, PacketType};
use crate::{Connection, ABI_VERSION, CONN_REQ_LEN};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use self::conn::{
    Conn, Phase, TxDesc, TxKind, TxNotify, TxPool, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SEND_TIMEOUT,
};
use self::rma::{CompletionPhase, RmaKind, RmaOp};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Datagram budget per packet when the device does not set `mtu`.
const DEFAULT_MTU: u32 = crate::defaults::MTU;
/// Largest usable `mtu`: payload length travels in 16 bits.
const MAX_MTU: u32 = u16::MAX as u32 + wire::HEADER_LEN as u32;
/// Default TX descriptor pool size.
const DEFAULT_SEND_BUFS: usize = crate::defaults::SEND_BUF_COUNT;
/// Default RX slot pool size.
const DEFAULT_RECV_BUFS: usize = crate::defaults::RECV_BUF_COUNT;
/// Socket buffer request; large enough that loopback bursts survive.
const SOCKET_BUF: usize = 1 << 20;

/// The UDP transport singleton.
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        UdpTransport
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn init(&self, abi_version: u32, _flags: u32) -> Result<TransportCaps> {
        if abi_version != ABI_VERSION {
            return Err(Status::Invalid);
        }
        Ok(TransportCaps { thread_safe: true })
    }

    fn enumerate(&self, profiles: &[DeviceProfile]) -> Vec<Device> {
        let mut devices = Vec::new();
        for profile in profiles.iter().filter(|p| p.transport == "udp") {
            let mtu = profile
                .param("mtu")
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(DEFAULT_MTU)
                .clamp(wire::HEADER_LEN as u32 + 1, MAX_MTU);
            // A device with an unparseable address exists but stays down.
            let up = profile
                .param("ip")
                .map_or(true, |ip| ip.parse::<IpAddr>().is_ok());
            if !up {
                warn!(device = %profile.name, "bad ip parameter; device is down");
            }
            devices.push(Device::from_profile(
                profile,
                mtu - wire::HEADER_LEN as u32,
                up,
            ));
        }
        if profiles.is_empty() {
            // Configless processes still get a usable device.
            devices.push(Device {
                name: "udp".to_string(),
                transport: "udp".to_string(),
                priority: crate::config::DEFAULT_PRIORITY,
                up: true,
                is_default: true,
                params: Vec::new(),
                max_send_size: DEFAULT_MTU - wire::HEADER_LEN as u32,
                rate: 0,
                pci: None,
            });
        }
        devices
    }

    fn create_endpoint(
        &self,
        device: &Device,
        service: Option<u16>,
        endpoint_id: u32,
    ) -> Result<(Arc<dyn EndpointOps>, WakeHandle)> {
        UdpEndpoint::create(device, service, endpoint_id)
    }
}

/// Mutable endpoint-wide options.
pub(super) struct EndpointOpts {
    pub send_timeout: Duration,
    pub keepalive: Duration,
}

/// One UDP endpoint: socket, pools, tables, event queue, progress state.
pub struct UdpEndpoint {
    pub(super) self_ref: Mutex<Weak<UdpEndpoint>>,
    pub(super) id: u32,
    pub(super) socket: UdpSocket,
    uri: String,
    pub(super) max_send_size: u32,
    pub(super) opts: Mutex<EndpointOpts>,
    pub(super) conns: RwLock<HashMap<u32, Arc<Conn>>>,
    conn_ids: Mutex<IdPool>,
    /// Passive-side dedup: (peer address, peer connection ID) -> local ID.
    pub(super) peers: Mutex<HashMap<(SocketAddr, u32), u32>>,
    pub(super) tx_pool: TxPool,
    pub(super) rx_pool: SlotPool,
    pub(super) events: EventQueue,
    pub(super) rma_regions: RwLock<HashMap<u64, Arc<RmaRegion>>>,
    rma_op_seq: AtomicU64,
    /// The endpoint's multicast-receive connection, if any.
    mc_rx: Mutex<Option<u32>>,
    /// Serialises progress passes; contenders skip rather than queue.
    pub(super) progress_mutex: Mutex<()>,
    progress_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    closed: AtomicBool,
    pub(super) device_failed: AtomicBool,
    /// Egress drop percentage, a testing hook from the `loss` device param.
    loss_pct: u32,
    loss_rng: Mutex<StdRng>,
}

impl UdpEndpoint {
    fn create(
        device: &Device,
        service: Option<u16>,
        endpoint_id: u32,
    ) -> Result<(Arc<dyn EndpointOps>, WakeHandle)> {
        if device.transport != "udp" || !device.up {
            return Err(Status::NoDevice);
        }
        let ip: IpAddr = device
            .param("ip")
            .map(|raw| raw.parse().map_err(|_| Status::NoDevice))
            .transpose()?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = match service {
            Some(port) => port,
            None => device
                .param("port")
                .and_then(|raw| raw.parse::<u16>().ok())
                .unwrap_or(0),
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|_| Status::NoDevice)?;
        socket.set_reuse_address(true).map_err(|_| Status::NoDevice)?;
        let _ = socket.set_recv_buffer_size(SOCKET_BUF);
        let _ = socket.set_send_buffer_size(SOCKET_BUF);
        socket
            .bind(&SocketAddr::new(ip, port).into())
            .map_err(|_| Status::NoDevice)?;
        socket.set_nonblocking(true).map_err(|_| Status::NoDevice)?;
        let socket: UdpSocket = socket.into();
        let local = socket.local_addr().map_err(|_| Status::NoDevice)?;

        // A wildcard bind still needs a connectable URI.
        let display_ip = if local.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            local.ip()
        };
        let uri = format!("udp://{}:{}", display_ip, local.port());

        let loss_pct = device
            .param("loss")
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(|pct| pct.min(100))
            .unwrap_or(0);
        if loss_pct > 0 {
            warn!(loss_pct, "egress loss injection enabled");
        }

        let (wake_rx, wake_tx) = os_pipe::pipe().map_err(|_| Status::NoMemory)?;
        endpoint::set_nonblocking(wake_rx.as_raw_fd())?;
        endpoint::set_nonblocking(wake_tx.as_raw_fd())?;

        let slot_size = device.max_send_size.max(CONN_REQ_LEN as u32) as usize;
        let endpoint = Arc::new(UdpEndpoint {
            self_ref: Mutex::new(Weak::new()),
            id: endpoint_id,
            socket,
            uri: uri.clone(),
            max_send_size: device.max_send_size,
            opts: Mutex::new(EndpointOpts {
                send_timeout: DEFAULT_SEND_TIMEOUT,
                keepalive: Duration::ZERO,
            }),
            conns: RwLock::new(HashMap::new()),
            conn_ids: Mutex::new(IdPool::new()),
            peers: Mutex::new(HashMap::new()),
            tx_pool: TxPool::new(DEFAULT_SEND_BUFS),
            rx_pool: SlotPool::new(DEFAULT_RECV_BUFS, slot_size),
            events: EventQueue::new(wake_tx),
            rma_regions: RwLock::new(HashMap::new()),
            rma_op_seq: AtomicU64::new(1),
            mc_rx: Mutex::new(None),
            progress_mutex: Mutex::new(()),
            progress_thread: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            device_failed: AtomicBool::new(false),
            loss_pct,
            loss_rng: Mutex::new(StdRng::from_entropy()),
        });
        *endpoint.self_ref.lock() = Arc::downgrade(&endpoint);

        if device.param("progress") != Some("poll") {
            let handle =
                progress::spawn(Arc::downgrade(&endpoint), Arc::clone(&endpoint.shutdown))?;
            *endpoint.progress_thread.lock() = Some(handle);
        }

        debug!(uri = %uri, id = endpoint_id, "endpoint created");
        let ops: Arc<dyn EndpointOps> = endpoint;
        Ok((ops, WakeHandle::new(wake_rx)))
    }

    pub(super) fn self_ops(&self) -> Weak<dyn EndpointOps> {
        let weak: Weak<UdpEndpoint> = self.self_ref.lock().clone();
        weak
    }

    pub(super) fn alloc_conn_id(&self) -> Option<u32> {
        self.conn_ids.lock().alloc()
    }

    pub(super) fn conn_handle(&self, id: u32) -> Connection {
        Connection {
            ops: self.self_ops(),
            id,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::Invalid);
        }
        Ok(())
    }

    pub(super) fn lookup(&self, id: u32) -> Result<Arc<Conn>> {
        self.conns.read().get(&id).cloned().ok_or(Status::Invalid)
    }

    /// Raw egress with the loss-injection hook applied.
    pub(super) fn transmit(&self, to: SocketAddr, packet: &[u8]) {
        if self.loss_pct > 0 && self.loss_rng.lock().gen_range(0..100) < self.loss_pct {
            trace!(bytes = packet.len(), "dropping egress datagram (loss injection)");
            return;
        }
        if let Err(err) = self.socket.send_to(packet, to) {
            // Datagram semantics: a refused send is a dropped packet and the
            // retransmit machinery covers it.
            trace!(%err, "send_to failed; packet dropped");
        }
    }

    /// Build and transmit a control packet (ACK / NACK / keepalive /
    /// handshake legs) that does not ride a TX descriptor.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn send_control(
        &self,
        to: SocketAddr,
        kind: PacketType,
        aux: u8,
        src: u32,
        dst: u32,
        seq: u32,
        ack: (u32, u32),
        payload: &[u8],
    ) {
        let mut packet = Vec::with_capacity(wire::HEADER_LEN + payload.len());
        Header {
            kind,
            aux,
            src,
            dst,
            seq,
            ack: ack.0,
            sack: ack.1,
            len: payload.len() as u16,
        }
        .write_to(&mut packet);
        packet.extend_from_slice(payload);
        self.transmit(to, &packet);
    }

    fn next_op_id(&self) -> u64 {
        self.rma_op_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove a connection from every table and release its ID.
    pub(super) fn remove_conn(&self, id: u32) -> Option<Arc<Conn>> {
        let removed = self.conns.write().remove(&id)?;
        {
            let state = removed.state.lock();
            self.peers.lock().remove(&(state.peer, state.peer_id));
            if state.attr == Attribute::UuMcRx {
                let mut mc = self.mc_rx.lock();
                if *mc == Some(id) {
                    *mc = None;
                }
                if let SocketAddr::V4(addr) = state.peer {
                    let _ = self
                        .socket
                        .leave_multicast_v4(addr.ip(), &Ipv4Addr::UNSPECIFIED);
                }
            }
        }
        self.conn_ids.lock().free(id);
        Some(removed)
    }

    /// Finish one TX descriptor: wake a blocking sender or stage a SEND
    /// event, update RMA bookkeeping, recycle the descriptor.
    ///
    /// Callers must not hold the connection's `tx` lock.
    pub(super) fn complete_tx(
        &self,
        conn: &Conn,
        desc: Box<TxDesc>,
        status: Status,
        staged: &mut Vec<Box<EventInner>>,
    ) {
        match desc.kind {
            TxKind::Msg => {
                if let Some(notify) = desc.notify.as_ref() {
                    notify.complete(status);
                } else if !desc.flags.contains(Flags::SILENT) {
                    staged.push(EventInner::new(EventKind::Send {
                        status,
                        context: desc.context,
                        connection: self.conn_handle(conn.id),
                    }));
                }
            }
            TxKind::RmaWrite { op, bytes } => {
                let mut rma = conn.rma.lock();
                if let Some(op) = rma.find_mut(op) {
                    op.outstanding = op.outstanding.saturating_sub(1);
                    if status == Status::Success {
                        op.done += bytes as u64;
                    } else if op.failed.is_none() {
                        op.failed = Some(status);
                    }
                }
            }
            TxKind::RmaReadRequest { op } => {
                let mut rma = conn.rma.lock();
                if let Some(op) = rma.find_mut(op) {
                    op.outstanding = op.outstanding.saturating_sub(1);
                    if status != Status::Success && op.failed.is_none() {
                        op.failed = Some(status);
                    }
                }
            }
            TxKind::RmaReadReply => {
                // The origin notices missing data through its own deadline;
                // nothing to record here.
            }
            TxKind::RmaCompletion { op } => {
                let mut rma = conn.rma.lock();
                if let Some(op) = rma.find_mut(op) {
                    if status == Status::Success {
                        op.completion_phase = CompletionPhase::Done;
                    } else if op.failed.is_none() {
                        op.failed = Some(status);
                    }
                }
            }
        }
        self.tx_pool.put(desc);
    }

    /// Poison a reliable connection: every in-flight and queued descriptor
    /// and every RMA operation completes with `status`, and subsequent
    /// sends fail synchronously until `disconnect`.
    pub(super) fn fail_conn(
        &self,
        conn: &Conn,
        status: Status,
        staged: &mut Vec<Box<EventInner>>,
    ) {
        {
            let mut state = conn.state.lock();
            if state.failed.is_none() {
                state.failed = Some(status);
            }
            state.phase = Phase::Failed;
            state.keepalive = Duration::ZERO;
        }
        let drained: Vec<Box<TxDesc>> = {
            let mut tx = conn.tx.lock();
            let tx = &mut *tx;
            tx.in_flight.drain(..).chain(tx.queued.drain(..)).collect()
        };
        for desc in drained {
            self.complete_tx(conn, desc, status, staged);
        }
        // Early-arrival slots parked in the reorder queue go back to the
        // pool with the connection.
        let held: Vec<crate::event::RxSlot> = {
            let mut rx = conn.rx.lock();
            rx.deferred.clear();
            rx.hold.drain(..).map(|(_, slot)| slot).collect()
        };
        for slot in held {
            self.rx_pool.put(slot);
        }
        let done: Vec<RmaOp> = {
            let mut rma = conn.rma.lock();
            rma.replies.clear();
            for op in rma.ops.iter_mut() {
                if op.failed.is_none() {
                    op.failed = Some(status);
                }
            }
            rma.ops.drain(..).collect()
        };
        for op in done {
            self.finish_rma_op(conn, op, staged);
        }
    }

    pub(super) fn finish_rma_op(
        &self,
        conn: &Conn,
        op: RmaOp,
        staged: &mut Vec<Box<EventInner>>,
    ) {
        let status = op.status();
        if let Some(notify) = op.notify.as_ref() {
            notify.complete(status);
        } else if !op.flags.contains(Flags::SILENT) {
            staged.push(EventInner::new(EventKind::Send {
                status,
                context: op.context,
                connection: self.conn_handle(conn.id),
            }));
        }
    }

    /// Push staged events onto the ready queue.
    pub(super) fn publish(&self, staged: Vec<Box<EventInner>>) {
        for inner in staged {
            self.events.push(inner);
        }
    }
}

fn parse_uri(uri: &str) -> Result<SocketAddr> {
    let rest = uri.strip_prefix("udp://").ok_or(Status::Invalid)?;
    rest.to_socket_addrs()
        .map_err(|_| Status::Invalid)?
        .find(|addr| addr.is_ipv4())
        .ok_or(Status::Invalid)
}

impl EndpointOps for UdpEndpoint {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: Attribute,
        context: u64,
        _flags: Flags,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.check_open()?;
        if payload.len() > CONN_REQ_LEN {
            return Err(Status::Invalid);
        }
        if attribute.is_multicast() && !payload.is_empty() {
            return Err(Status::Invalid);
        }
        let peer = parse_uri(server_uri)?;
        let default_keepalive = self.opts.lock().keepalive;

        if attribute.is_multicast() {
            if attribute == Attribute::UuMcRx {
                let group = match peer {
                    SocketAddr::V4(addr) if addr.ip().is_multicast() => *addr.ip(),
                    _ => return Err(Status::Invalid),
                };
                let mut mc = self.mc_rx.lock();
                if mc.is_some() {
                    return Err(Status::Invalid);
                }
                self.socket
                    .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                    .map_err(|_| Status::Generic)?;
                let id = self.conn_ids.lock().alloc().ok_or(Status::NoMemory)?;
                let conn = Conn::new(
                    id,
                    Phase::Ready,
                    attribute,
                    peer,
                    0,
                    context,
                    self.max_send_size,
                    rand::random(),
                    0,
                );
                self.conns.write().insert(id, conn);
                *mc = Some(id);
                drop(mc);
                self.events.push(EventInner::new(EventKind::Connect {
                    status: Status::Success,
                    context,
                    connection: Some(self.conn_handle(id)),
                }));
                return Ok(());
            }
            // UU_MC_TX: egress only, no membership needed.
            let id = self.conn_ids.lock().alloc().ok_or(Status::NoMemory)?;
            let conn = Conn::new(
                id,
                Phase::Ready,
                attribute,
                peer,
                0,
                context,
                self.max_send_size,
                rand::random(),
                0,
            );
            self.conns.write().insert(id, conn);
            self.events.push(EventInner::new(EventKind::Connect {
                status: Status::Success,
                context,
                connection: Some(self.conn_handle(id)),
            }));
            return Ok(());
        }

        let id = self.conn_ids.lock().alloc().ok_or(Status::NoMemory)?;
        let initial_seq: u32 = rand::random();
        let conn = Conn::new(
            id,
            Phase::Requested,
            attribute,
            peer,
            0,
            context,
            self.max_send_size,
            initial_seq,
            0,
        );

        let mut packet = Vec::with_capacity(wire::HEADER_LEN + payload.len());
        Header {
            kind: PacketType::ConnRequest,
            aux: attribute.to_wire(),
            src: id,
            dst: 0,
            seq: initial_seq,
            ack: 0,
            sack: 0,
            len: payload.len() as u16,
        }
        .write_to(&mut packet);
        packet.extend_from_slice(payload);

        {
            let now = Instant::now();
            let mut state = conn.state.lock();
            state.keepalive = default_keepalive;
            state.hs_packet = packet.clone();
            state.hs_deadline = now + timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
            state.hs_last_send = now;
        }
        self.conns.write().insert(id, conn);
        debug!(conn = id, uri = server_uri, "connection requested");
        self.transmit(peer, &packet);
        self.progress();
        Ok(())
    }

    fn accept(&self, request: u32, context: u64) -> Result<()> {
        self.check_open()?;
        let conn = self.lookup(request)?;
        let default_keepalive = self.opts.lock().keepalive;
        let (packet, peer) = {
            let now = Instant::now();
            let mut state = conn.state.lock();
            if state.phase != Phase::Passive {
                return Err(Status::Invalid);
            }
            state.phase = Phase::AcceptWait;
            state.context = context;
            state.keepalive = default_keepalive;
            let mut packet = Vec::with_capacity(wire::HEADER_LEN);
            Header {
                kind: PacketType::ConnReply,
                aux: 0,
                src: conn.id,
                dst: state.peer_id,
                seq: state.local_seq_start,
                ack: 0,
                sack: 0,
                len: 0,
            }
            .write_to(&mut packet);
            state.hs_packet = packet.clone();
            state.hs_deadline = now + DEFAULT_CONNECT_TIMEOUT;
            state.hs_last_send = now;
            state.hs_resends = 0;
            (packet, state.peer)
        };
        debug!(conn = conn.id, "connection accepted; reply sent");
        self.transmit(peer, &packet);
        Ok(())
    }

    fn reject(&self, request: u32) -> Result<()> {
        self.check_open()?;
        let conn = self.lookup(request)?;
        let (peer, peer_id) = {
            let state = conn.state.lock();
            if state.phase != Phase::Passive {
                return Err(Status::Invalid);
            }
            (state.peer, state.peer_id)
        };
        self.send_control(
            peer,
            PacketType::ConnReject,
            0,
            request,
            peer_id,
            0,
            (0, 0),
            &[],
        );
        self.remove_conn(request);
        debug!(conn = request, "connection rejected");
        Ok(())
    }

    fn disconnect(&self, conn_id: u32) -> Result<()> {
        self.check_open()?;
        let conn = self.lookup(conn_id)?;
        let mut staged = Vec::new();
        self.fail_conn(&conn, Status::Disconnected, &mut staged);
        self.remove_conn(conn_id);
        self.publish(staged);
        debug!(conn = conn_id, "disconnected");
        Ok(())
    }

    fn send(&self, conn_id: u32, iov: &[&[u8]], context: u64, flags: Flags) -> Result<()> {
        self.check_open()?;
        let conn = self.lookup(conn_id)?;
        let total: usize = iov.iter().map(|part| part.len()).sum();
        let default_timeout = self.opts.lock().send_timeout;

        let (attr, peer, peer_id, deadline) = {
            let state = conn.state.lock();
            if let Some(failed) = state.failed {
                return Err(failed);
            }
            if state.phase != Phase::Ready || state.attr == Attribute::UuMcRx {
                return Err(Status::Invalid);
            }
            if total > state.max_send_size as usize {
                return Err(Status::Invalid);
            }
            let timeout = state.send_timeout.unwrap_or(default_timeout);
            (state.attr, state.peer, state.peer_id, Instant::now() + timeout)
        };

        if !attr.is_reliable() {
            // Unreliable: one shot on the wire, immediate local completion.
            let seq = {
                let mut tx = conn.tx.lock();
                let seq = tx.next_seq;
                tx.next_seq = seq.wrapping_add(1);
                seq
            };
            let mut packet = Vec::with_capacity(wire::HEADER_LEN + total);
            Header {
                kind: PacketType::Msg,
                aux: 0,
                src: conn_id,
                dst: peer_id,
                seq,
                ack: 0,
                sack: 0,
                len: total as u16,
            }
            .write_to(&mut packet);
            for part in iov {
                packet.extend_from_slice(part);
            }
            self.transmit(peer, &packet);
            if !flags.contains(Flags::SILENT) && !flags.contains(Flags::BLOCKING) {
                self.events.push(EventInner::new(EventKind::Send {
                    status: Status::Success,
                    context,
                    connection: self.conn_handle(conn_id),
                }));
            }
            return Ok(());
        }

        let mut desc = self.tx_pool.take().ok_or(Status::NoBufferSpace)?;
        let notify = if flags.contains(Flags::BLOCKING) {
            Some(TxNotify::new())
        } else {
            None
        };
        let ack = {
            let mut rx = conn.rx.lock();
            rx.ack_pending = false;
            rx.ack_fields()
        };
        desc.kind = TxKind::Msg;
        desc.context = context;
        desc.flags = flags;
        desc.deadline = deadline;
        desc.notify = notify.clone();
        {
            let mut tx = conn.tx.lock();
            let seq = tx.next_seq;
            tx.next_seq = seq.wrapping_add(1);
            desc.seq = seq;
            desc.packet.clear();
            Header {
                kind: PacketType::Msg,
                aux: 0,
                src: conn_id,
                dst: peer_id,
                seq,
                ack: ack.0,
                sack: ack.1,
                len: total as u16,
            }
            .write_to(&mut desc.packet);
            for part in iov {
                desc.packet.extend_from_slice(part);
            }
            if tx.has_window() {
                desc.last_send = Instant::now();
                self.transmit(peer, &desc.packet);
                tx.in_flight.push_back(desc);
            } else {
                tx.queued.push_back(desc);
            }
        }
        trace!(conn = conn_id, len = total, "reliable send queued");
        self.progress();

        if let Some(notify) = notify {
            let status = notify.wait_while(|| self.progress());
            return match status {
                Status::Success => Ok(()),
                other => Err(other),
            };
        }
        Ok(())
    }

    fn rma_register(&self, buf: Vec<u8>, protection: Flags) -> Result<RmaHandle> {
        self.check_open()?;
        if !protection.contains(Flags::READ) && !protection.contains(Flags::WRITE) {
            return Err(Status::Invalid);
        }
        let mut regions = self.rma_regions.write();
        let token = loop {
            let candidate: u64 = rand::random();
            if candidate != 0 && !regions.contains_key(&candidate) {
                break candidate;
            }
        };
        let region = Arc::new(RmaRegion {
            token,
            protection,
            buf: RwLock::new(buf.into_boxed_slice()),
        });
        regions.insert(token, Arc::clone(&region));
        debug!(token, len = region.len(), "RMA region registered");
        Ok(RmaHandle {
            ops: self.self_ops(),
            region,
        })
    }

    fn rma_deregister(&self, token: u64) -> Result<Vec<u8>> {
        self.check_open()?;
        let region = self
            .rma_regions
            .write()
            .remove(&token)
            .ok_or(Status::Invalid)?;
        // Abort local operations sourced from or targeting this region.
        let conns: Vec<Arc<Conn>> = self.conns.read().values().cloned().collect();
        for conn in conns {
            let mut rma = conn.rma.lock();
            for op in rma.ops.iter_mut() {
                if op.local.token == token && op.failed.is_none() {
                    op.failed = Some(Status::Disconnected);
                }
            }
            rma.replies.retain(|job| job.token != token);
        }
        let buf = std::mem::take(&mut *region.buf.write());
        debug!(token, "RMA region deregistered");
        Ok(buf.into_vec())
    }

    fn rma(
        &self,
        conn_id: u32,
        completion: Option<&[u8]>,
        local_token: u64,
        local_offset: u64,
        remote: &RmaRemoteHandle,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: Flags,
    ) -> Result<()> {
        self.check_open()?;
        let conn = self.lookup(conn_id)?;
        let read = flags.contains(Flags::READ);
        let write = flags.contains(Flags::WRITE);
        if read == write || len == 0 {
            return Err(Status::Invalid);
        }
        let local = self
            .rma_regions
            .read()
            .get(&local_token)
            .cloned()
            .ok_or(Status::Invalid)?;
        endpoint::checked_range(local_offset, len, local.len())?;
        endpoint::checked_range(remote_offset, len, remote.len())?;
        let default_timeout = self.opts.lock().send_timeout;

        let deadline = {
            let state = conn.state.lock();
            if let Some(failed) = state.failed {
                return Err(failed);
            }
            if state.phase != Phase::Ready || !state.attr.is_reliable() {
                return Err(Status::Invalid);
            }
            if let Some(msg) = completion {
                if msg.len() > state.max_send_size as usize {
                    return Err(Status::Invalid);
                }
            }
            Instant::now() + state.send_timeout.unwrap_or(default_timeout)
        };

        let notify = if flags.contains(Flags::BLOCKING) {
            Some(TxNotify::new())
        } else {
            None
        };
        let op = RmaOp {
            id: self.next_op_id(),
            kind: if read { RmaKind::Read } else { RmaKind::Write },
            local,
            local_offset,
            remote_token: remote.token(),
            remote_offset,
            len,
            issued: 0,
            outstanding: 0,
            done: 0,
            completion: completion.map(|msg| msg.to_vec()),
            completion_phase: CompletionPhase::Pending,
            context,
            flags,
            deadline,
            failed: None,
            notify: notify.clone(),
        };
        trace!(conn = conn_id, op = op.id, len, read, "RMA queued");
        conn.rma.lock().ops.push_back(op);
        self.progress();

        if let Some(notify) = notify {
            let status = notify.wait_while(|| self.progress());
            return match status {
                Status::Success => Ok(()),
                other => Err(other),
            };
        }
        Ok(())
    }

    fn get_event(&self) -> Result<Option<Event>> {
        self.check_open()?;
        self.progress();
        match self.events.pop() {
            Some(inner) => Ok(Some(Event::new(self.self_ops(), inner))),
            None if self.rx_pool.is_exhausted() => Err(Status::NoBufferSpace),
            None => Ok(None),
        }
    }

    fn return_event(&self, inner: Box<EventInner>) -> Result<()> {
        let mut inner = inner;
        if let Some(slot) = inner.slot.take() {
            self.rx_pool.put(slot);
        }
        Ok(())
    }

    fn endpoint_set_opt(&self, option: EndpointOption, value: u64) -> Result<()> {
        self.check_open()?;
        match option {
            EndpointOption::SendTimeout => {
                if value == 0 {
                    return Err(Status::Invalid);
                }
                self.opts.lock().send_timeout = Duration::from_micros(value);
            }
            EndpointOption::RecvBufCount => {
                if value == 0 {
                    return Err(Status::Invalid);
                }
                self.rx_pool.resize(value as usize)?;
            }
            EndpointOption::SendBufCount => {
                if value == 0 {
                    return Err(Status::Invalid);
                }
                self.tx_pool.resize(value as usize)?;
            }
            EndpointOption::KeepaliveTimeout => {
                self.opts.lock().keepalive = Duration::from_micros(value);
            }
            EndpointOption::Uri | EndpointOption::RmaAlign => return Err(Status::Invalid),
        }
        Ok(())
    }

    fn endpoint_get_opt(&self, option: EndpointOption) -> Result<OptValue> {
        self.check_open()?;
        Ok(match option {
            EndpointOption::SendTimeout => {
                OptValue::Uint(self.opts.lock().send_timeout.as_micros() as u64)
            }
            EndpointOption::RecvBufCount => OptValue::Uint(self.rx_pool.free_count() as u64),
            EndpointOption::SendBufCount => OptValue::Uint(self.tx_pool.free_count() as u64),
            EndpointOption::KeepaliveTimeout => {
                OptValue::Uint(self.opts.lock().keepalive.as_micros() as u64)
            }
            EndpointOption::Uri => OptValue::Text(self.uri.clone()),
            // The datagram transport copies; any alignment goes.
            EndpointOption::RmaAlign => OptValue::Uint(1),
        })
    }

    fn conn_set_opt(&self, conn_id: u32, option: ConnectionOption, value: u64) -> Result<()> {
        self.check_open()?;
        let conn = self.lookup(conn_id)?;
        let mut state = conn.state.lock();
        match option {
            ConnectionOption::SendTimeout => {
                state.send_timeout = if value == 0 {
                    None
                } else {
                    Some(Duration::from_micros(value))
                };
            }
            ConnectionOption::KeepaliveTimeout => {
                state.keepalive = Duration::from_micros(value);
                state.ka_outstanding = false;
                state.ka_last_sent = Instant::now();
                state.last_heard = Instant::now();
            }
        }
        Ok(())
    }

    fn conn_get_opt(&self, conn_id: u32, option: ConnectionOption) -> Result<OptValue> {
        self.check_open()?;
        let conn = self.lookup(conn_id)?;
        let state = conn.state.lock();
        Ok(match option {
            ConnectionOption::SendTimeout => OptValue::Uint(
                state
                    .send_timeout
                    .unwrap_or_else(|| self.opts.lock().send_timeout)
                    .as_micros() as u64,
            ),
            ConnectionOption::KeepaliveTimeout => {
                OptValue::Uint(state.keepalive.as_micros() as u64)
            }
        })
    }

    fn conn_attribute(&self, conn_id: u32) -> Result<Attribute> {
        self.check_open()?;
        Ok(self.lookup(conn_id)?.state.lock().attr)
    }

    fn conn_max_send_size(&self, conn_id: u32) -> Result<u32> {
        self.check_open()?;
        Ok(self.lookup(conn_id)?.state.lock().max_send_size)
    }

    fn conn_context(&self, conn_id: u32) -> Result<u64> {
        self.check_open()?;
        Ok(self.lookup(conn_id)?.state.lock().context)
    }

    fn arm_wake(&self) -> Result<()> {
        self.check_open()?;
        if !self.events.is_empty() {
            self.events.signal();
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.progress_thread.lock().take() {
            let _ = handle.join();
        }
        // Unblock pending BLOCKING callers and recycle descriptors.
        let conns: Vec<Arc<Conn>> = self.conns.write().drain().map(|(_, c)| c).collect();
        let mut staged = Vec::new();
        for conn in &conns {
            self.fail_conn(conn, Status::Disconnected, &mut staged);
        }
        // The endpoint is going away; staged events are dropped, but leased
        // slots inside queued events must come home.
        for inner in self.events.drain() {
            let mut inner = inner;
            if let Some(slot) = inner.slot.take() {
                self.rx_pool.put(slot);
            }
        }
        crate::release_endpoint_id(self.id);
        debug!(id = self.id, "endpoint closed");
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown.store(true, Ordering::Release);
            if let Some(handle) = self.progress_thread.lock().take() {
                let _ = handle.join();
            }
            crate::release_endpoint_id(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        assert!(parse_uri("udp://127.0.0.1:4000").is_ok());
        assert_eq!(parse_uri("tcp://127.0.0.1:4000").unwrap_err(), Status::Invalid);
        assert_eq!(parse_uri("127.0.0.1:4000").unwrap_err(), Status::Invalid);
        assert_eq!(parse_uri("udp://nonsense").unwrap_err(), Status::Invalid);
    }

    #[test]
    fn enumerate_claims_profiles_and_falls_back() {
        let transport = UdpTransport::new();
        let devices = transport.enumerate(&[]);
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_default);
        assert_eq!(devices[0].max_send_size, DEFAULT_MTU - wire::HEADER_LEN as u32);

        let profiles = vec![
            crate::config::DeviceProfile {
                name: "good".into(),
                transport: "udp".into(),
                priority: 60,
                is_default: false,
                params: vec![("mtu".into(), "4096".into())],
            },
            crate::config::DeviceProfile {
                name: "broken".into(),
                transport: "udp".into(),
                priority: 50,
                is_default: false,
                params: vec![("ip".into(), "not-an-ip".into())],
            },
            crate::config::DeviceProfile {
                name: "other".into(),
                transport: "verbs".into(),
                priority: 90,
                is_default: false,
                params: vec![],
            },
        ];
        let devices = transport.enumerate(&profiles);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "good");
        assert_eq!(devices[0].max_send_size, 4096 - wire::HEADER_LEN as u32);
        assert!(!devices[1].up);
    }

    #[test]
    fn abi_is_checked() {
        let transport = UdpTransport::new();
        assert!(transport.init(ABI_VERSION, 0).is_ok());
        assert_eq!(transport.init(ABI_VERSION + 1, 0).unwrap_err(), Status::Invalid);
    }
}
