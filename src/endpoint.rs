//! # Public Handles
//!
//! The application-facing types: [`Endpoint`] and [`Connection`] are thin
//! dispatchers over the transport's [`EndpointOps`] object, [`WakeHandle`]
//! is the pollable blocking aid, and the RMA handle types carry memory
//! registrations and their 32-byte wire descriptors.
//!
//! ## Container fan-in
//!
//! Children never own their parents. A `Connection` refers to its endpoint
//! by a non-owning handle plus its connection ID; every call revalidates the
//! ID against the endpoint's table, so a handle kept across `disconnect` or
//! endpoint teardown degrades to `Status::Invalid` instead of dangling.

use crate::event::Event;
use crate::status::{Result, Status};
use crate::transport::EndpointOps;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Operation flags. The numeric values are part of the stable API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    /// No flags.
    pub const NONE: Flags = Flags(0);
    /// Block the caller until the operation completes.
    pub const BLOCKING: Flags = Flags(1 << 0);
    /// The caller promises the buffer stays valid until completion. The
    /// datagram transport bounce-copies regardless.
    pub const NO_COPY: Flags = Flags(1 << 1);
    /// Suppress the local completion event.
    pub const SILENT: Flags = Flags(1 << 3);
    /// RMA: read from the remote region.
    pub const READ: Flags = Flags(1 << 4);
    /// RMA: write to the remote region.
    pub const WRITE: Flags = Flags(1 << 5);
    /// RMA: connection-scoped ordering barrier.
    pub const FENCE: Flags = Flags(1 << 6);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Connection attribute: reliability and ordering agreed at establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Reliable, ordered.
    Ro,
    /// Reliable, unordered.
    Ru,
    /// Unreliable, unordered.
    Uu,
    /// Unreliable multicast, send side.
    UuMcTx,
    /// Unreliable multicast, receive side.
    UuMcRx,
}

impl Attribute {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Attribute::Ro => 0,
            Attribute::Ru => 1,
            Attribute::Uu => 2,
            Attribute::UuMcTx => 3,
            Attribute::UuMcRx => 4,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Result<Attribute> {
        Ok(match byte {
            0 => Attribute::Ro,
            1 => Attribute::Ru,
            2 => Attribute::Uu,
            3 => Attribute::UuMcTx,
            4 => Attribute::UuMcRx,
            _ => return Err(Status::Invalid),
        })
    }

    /// Reliable attributes carry the full sliding-window machinery.
    pub fn is_reliable(self) -> bool {
        matches!(self, Attribute::Ro | Attribute::Ru)
    }

    pub fn is_multicast(self) -> bool {
        matches!(self, Attribute::UuMcTx | Attribute::UuMcRx)
    }
}

/// Capabilities reported by `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    /// All endpoint operations may be called from multiple threads
    /// concurrently.
    pub thread_safe: bool,
}

/// Endpoint-scoped options for `set_opt`/`get_opt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOption {
    /// Default send timeout, microseconds.
    SendTimeout,
    /// Receive descriptor pool size. The getter reports currently-free
    /// descriptors, which equals the configured size when nothing is leased.
    RecvBufCount,
    /// Send descriptor pool size; getter semantics as for `RecvBufCount`.
    SendBufCount,
    /// Default keepalive period applied to new connections, microseconds.
    KeepaliveTimeout,
    /// The endpoint URI (get-only).
    Uri,
    /// RMA alignment requirement in bytes (get-only).
    RmaAlign,
}

/// Connection-scoped options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    /// Send timeout for this connection, microseconds; overrides the
    /// endpoint default.
    SendTimeout,
    /// Keepalive period for this connection, microseconds; 0 disarms.
    KeepaliveTimeout,
}

/// Value returned by the option getters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    Uint(u64),
    Text(String),
}

impl OptValue {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            OptValue::Uint(value) => Some(*value),
            OptValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptValue::Text(text) => Some(text),
            OptValue::Uint(_) => None,
        }
    }
}

/// A local communication resource collection bound to one device.
///
/// Cloning is cheap and shares the endpoint; the endpoint shuts down when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) ops: Arc<dyn EndpointOps>,
}

impl Endpoint {
    /// The endpoint's URI, suitable for a peer's `connect`.
    pub fn uri(&self) -> String {
        self.ops.uri()
    }

    /// Initiate a connection to `server_uri` with up to
    /// [`crate::CONN_REQ_LEN`] bytes of opaque payload. The outcome arrives
    /// as a CONNECT event carrying `context`.
    pub fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: Attribute,
        context: u64,
        flags: Flags,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ops
            .connect(server_uri, payload, attribute, context, flags, timeout)
    }

    /// Accept a pending CONNECT_REQUEST event. The new connection arrives in
    /// a subsequent ACCEPT event carrying `context`.
    pub fn accept(&self, event: &Event, context: u64) -> Result<()> {
        if !Weak::ptr_eq(&event.ops, &Arc::downgrade(&self.ops)) {
            return Err(Status::Invalid);
        }
        let request = event.request_id().ok_or(Status::Invalid)?;
        self.ops.accept(request, context)?;
        event.mark_handled();
        Ok(())
    }

    /// Reject a pending CONNECT_REQUEST event.
    pub fn reject(&self, event: &Event) -> Result<()> {
        if !Weak::ptr_eq(&event.ops, &Arc::downgrade(&self.ops)) {
            return Err(Status::Invalid);
        }
        let request = event.request_id().ok_or(Status::Invalid)?;
        self.ops.reject(request)?;
        event.mark_handled();
        Ok(())
    }

    /// Poll for the next event, driving transport progress. `Ok(None)` means
    /// no event is ready; `Err(NoBufferSpace)` additionally signals that the
    /// receive pool is exhausted and events must be returned before more
    /// messages can arrive.
    pub fn get_event(&self) -> Result<Option<Event>> {
        self.ops.get_event()
    }

    /// Return an event, releasing its receive-buffer lease. A
    /// CONNECT_REQUEST that was neither accepted nor rejected is refused
    /// with `Invalid` and stays with the caller.
    pub fn return_event(&self, event: &mut Event) -> Result<()> {
        if !Weak::ptr_eq(&event.ops, &Arc::downgrade(&self.ops)) {
            return Err(Status::Invalid);
        }
        let inner = event.inner.take().ok_or(Status::Invalid)?;
        if inner.is_unconsumed_request() {
            event.inner = Some(inner);
            return Err(Status::Invalid);
        }
        self.ops.return_event(inner)
    }

    /// Re-arm level signalling on the wake handle: if events are ready, the
    /// handle is signalled again. For pollers with one-shot semantics.
    pub fn arm_wake(&self) -> Result<()> {
        self.ops.arm_wake()
    }

    pub fn set_opt(&self, option: EndpointOption, value: u64) -> Result<()> {
        self.ops.endpoint_set_opt(option, value)
    }

    pub fn get_opt(&self, option: EndpointOption) -> Result<OptValue> {
        self.ops.endpoint_get_opt(option)
    }

    /// Register `buf` for remote memory access with the given protection
    /// (`Flags::READ` and/or `Flags::WRITE`). The returned handle gives
    /// local access and produces the descriptor a peer needs.
    pub fn rma_register(&self, buf: Vec<u8>, protection: Flags) -> Result<RmaHandle> {
        self.ops.rma_register(buf, protection)
    }

    /// Tear down a registration, returning the buffer. In-flight operations
    /// against the handle abort with `Disconnected`; remote fragments naming
    /// the stale token are refused with an RMA-handle error.
    pub fn rma_deregister(&self, handle: &RmaHandle) -> Result<Vec<u8>> {
        self.ops.rma_deregister(handle.region.token)
    }

    /// Tear the endpoint down immediately: every child connection, RMA
    /// handle and event becomes invalid atomically, and pending `BLOCKING`
    /// callers abort with `Disconnected`. Dropping the last clone has the
    /// same effect.
    pub fn destroy(self) {
        self.ops.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("uri", &self.ops.uri()).finish()
    }
}

/// One end of an established (or in-progress) connection.
///
/// The handle is cheap to clone and validated against the endpoint on every
/// call; after `disconnect` or endpoint teardown it returns `Invalid`.
#[derive(Clone)]
pub struct Connection {
    pub(crate) ops: Weak<dyn EndpointOps>,
    pub(crate) id: u32,
}

impl Connection {
    fn ops(&self) -> Result<Arc<dyn EndpointOps>> {
        self.ops.upgrade().ok_or(Status::Invalid)
    }

    /// Send a short message. The completion arrives as a SEND event with
    /// `context` unless `SILENT`; with `BLOCKING` the call waits for the
    /// completion and returns its status directly.
    pub fn send(&self, msg: &[u8], context: u64, flags: Flags) -> Result<()> {
        self.ops()?.send(self.id, &[msg], context, flags)
    }

    /// Gather variant of [`send`](Self::send).
    pub fn sendv(&self, iov: &[&[u8]], context: u64, flags: Flags) -> Result<()> {
        self.ops()?.send(self.id, iov, context, flags)
    }

    /// One-sided remote memory access. Exactly one of `READ`/`WRITE` must be
    /// set; `completion` (if any) is delivered to the peer as an ordinary
    /// message once the data is remotely complete.
    #[allow(clippy::too_many_arguments)]
    pub fn rma(
        &self,
        completion: Option<&[u8]>,
        local: &RmaHandle,
        local_offset: u64,
        remote: &RmaRemoteHandle,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: Flags,
    ) -> Result<()> {
        self.ops()?.rma(
            self.id,
            completion,
            local.region.token,
            local_offset,
            remote,
            remote_offset,
            len,
            context,
            flags,
        )
    }

    /// Tear the connection down, aborting in-flight operations with
    /// `Disconnected`.
    pub fn disconnect(&self) -> Result<()> {
        self.ops()?.disconnect(self.id)
    }

    pub fn set_opt(&self, option: ConnectionOption, value: u64) -> Result<()> {
        self.ops()?.conn_set_opt(self.id, option, value)
    }

    pub fn get_opt(&self, option: ConnectionOption) -> Result<OptValue> {
        self.ops()?.conn_get_opt(self.id, option)
    }

    pub fn attribute(&self) -> Result<Attribute> {
        self.ops()?.conn_attribute(self.id)
    }

    /// Largest message this connection accepts.
    pub fn max_send_size(&self) -> Result<u32> {
        self.ops()?.conn_max_send_size(self.id)
    }

    /// The application context attached at `connect`/`accept` time.
    pub fn context(&self) -> Result<u64> {
        self.ops()?.conn_context(self.id)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.ops, &other.ops)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// Pollable signal that the endpoint has work for the application. The
/// transport signals it on every empty→non-empty event-queue transition;
/// poll the descriptor (or use [`wait`](Self::wait)), then drain events with
/// `get_event`.
pub struct WakeHandle {
    reader: os_pipe::PipeReader,
}

impl WakeHandle {
    pub(crate) fn new(reader: os_pipe::PipeReader) -> Self {
        Self { reader }
    }

    /// Wait until the endpoint signals, or until `timeout` elapses with
    /// `None` meaning wait forever. Returns whether the handle was
    /// signalled; pending signal bytes are drained before returning.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let ready = unsafe { libc::poll(&mut fds, 1, millis) };
        if ready < 0 {
            return Err(Status::Generic);
        }
        if ready == 0 {
            return Ok(false);
        }
        // Drain pending wake bytes; the pipe is non-blocking.
        let mut buf = [0u8; 64];
        while matches!(self.reader.read(&mut buf), Ok(n) if n > 0) {}
        Ok(true)
    }
}

impl AsRawFd for WakeHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

/// Set a descriptor non-blocking; used for the wake pipe's two ends.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Status::Generic);
        }
    }
    Ok(())
}

/// A local memory registration held by the application.
pub(crate) struct RmaRegion {
    pub(crate) token: u64,
    pub(crate) protection: Flags,
    pub(crate) buf: RwLock<Box<[u8]>>,
}

impl RmaRegion {
    pub(crate) fn len(&self) -> u64 {
        self.buf.read().len() as u64
    }
}

/// Size of the serialised RMA descriptor: four 64-bit words.
pub const RMA_DESCRIPTOR_LEN: usize = 32;

/// Handle to a local RMA registration. Grants local access to the region
/// and produces the wire descriptor a peer uses to address it.
pub struct RmaHandle {
    pub(crate) ops: Weak<dyn EndpointOps>,
    pub(crate) region: Arc<RmaRegion>,
}

impl RmaHandle {
    /// The registration's opaque 64-bit token.
    pub fn token(&self) -> u64 {
        self.region.token
    }

    pub fn len(&self) -> u64 {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialise the handle for transmission to a peer (network byte
    /// order): token, length, protection, reserved-zero.
    pub fn descriptor(&self) -> [u8; RMA_DESCRIPTOR_LEN] {
        let mut buf = Vec::with_capacity(RMA_DESCRIPTOR_LEN);
        let _ = buf.write_u64::<BigEndian>(self.region.token);
        let _ = buf.write_u64::<BigEndian>(self.len());
        let _ = buf.write_u64::<BigEndian>(self.region.protection.bits() as u64);
        let _ = buf.write_u64::<BigEndian>(0);
        let mut out = [0u8; RMA_DESCRIPTOR_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Copy bytes out of the registered region.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let buf = self.region.buf.read();
        let range = checked_range(offset, dst.len() as u64, buf.len() as u64)?;
        dst.copy_from_slice(&buf[range]);
        Ok(())
    }

    /// Copy bytes into the registered region.
    pub fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut buf = self.region.buf.write();
        let range = checked_range(offset, src.len() as u64, buf.len() as u64)?;
        buf[range].copy_from_slice(src);
        Ok(())
    }
}

impl std::fmt::Debug for RmaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmaHandle")
            .field("token", &self.region.token)
            .field("len", &self.len())
            .finish()
    }
}

/// A peer's registration, reconstructed from its 32-byte descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaRemoteHandle {
    pub(crate) token: u64,
    pub(crate) len: u64,
    pub(crate) protection: Flags,
}

impl RmaRemoteHandle {
    pub fn from_descriptor(descriptor: &[u8; RMA_DESCRIPTOR_LEN]) -> Result<Self> {
        let mut cursor = &descriptor[..];
        let token = cursor.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?;
        let len = cursor.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?;
        let protection = cursor.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?;
        let reserved = cursor.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?;
        if token == 0 || reserved != 0 || protection > u32::MAX as u64 {
            return Err(Status::Invalid);
        }
        Ok(Self {
            token,
            len,
            protection: Flags::from_bits(protection as u32),
        })
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Range check shared by region access paths.
pub(crate) fn checked_range(
    offset: u64,
    len: u64,
    region_len: u64,
) -> Result<std::ops::Range<usize>> {
    let end = offset.checked_add(len).ok_or(Status::Invalid)?;
    if end > region_len {
        return Err(Status::Invalid);
    }
    Ok(offset as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let flags = Flags::READ | Flags::FENCE;
        assert!(flags.contains(Flags::READ));
        assert!(flags.contains(Flags::FENCE));
        assert!(!flags.contains(Flags::WRITE));
        assert_eq!(Flags::BLOCKING.bits(), 1);
        assert_eq!(Flags::NO_COPY.bits(), 2);
        assert_eq!(Flags::SILENT.bits(), 8);
        assert_eq!(Flags::READ.bits(), 16);
        assert_eq!(Flags::WRITE.bits(), 32);
        assert_eq!(Flags::FENCE.bits(), 64);
    }

    #[test]
    fn attribute_wire_round_trip() {
        for attr in [
            Attribute::Ro,
            Attribute::Ru,
            Attribute::Uu,
            Attribute::UuMcTx,
            Attribute::UuMcRx,
        ] {
            assert_eq!(Attribute::from_wire(attr.to_wire()).unwrap(), attr);
        }
        assert_eq!(Attribute::from_wire(9).unwrap_err(), Status::Invalid);
    }

    #[test]
    fn remote_handle_descriptor_round_trip() {
        let region = Arc::new(RmaRegion {
            token: 0xfeed_f00d_dead_beef,
            protection: Flags::READ | Flags::WRITE,
            buf: RwLock::new(vec![0u8; 128].into_boxed_slice()),
        });
        let handle = RmaHandle {
            ops: Weak::<crate::transport::udp::UdpEndpoint>::new(),
            region,
        };
        let descriptor = handle.descriptor();
        let remote = RmaRemoteHandle::from_descriptor(&descriptor).unwrap();
        assert_eq!(remote.token(), 0xfeed_f00d_dead_beef);
        assert_eq!(remote.len(), 128);
        assert!(remote.protection.contains(Flags::READ));

        let mut bad = descriptor;
        bad[31] = 1; // reserved word must be zero
        assert_eq!(RmaRemoteHandle::from_descriptor(&bad).unwrap_err(), Status::Invalid);
    }

    #[test]
    fn region_access_is_range_checked() {
        let region = Arc::new(RmaRegion {
            token: 1,
            protection: Flags::WRITE,
            buf: RwLock::new(vec![0u8; 16].into_boxed_slice()),
        });
        let handle = RmaHandle {
            ops: Weak::<crate::transport::udp::UdpEndpoint>::new(),
            region,
        };
        handle.write_at(4, b"abcd").unwrap();
        let mut out = [0u8; 4];
        handle.read_at(4, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
        assert_eq!(handle.write_at(13, b"abcd").unwrap_err(), Status::Invalid);
        assert_eq!(handle.read_at(u64::MAX, &mut out).unwrap_err(), Status::Invalid);
    }
}
