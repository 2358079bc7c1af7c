//! # Transport Plugin Contract
//!
//! Every wire technology plugs into the core through two object-safe
//! traits. [`Transport`] is the per-technology singleton: it verifies the
//! ABI, claims configured devices, and manufactures endpoints.
//! [`EndpointOps`] is the full per-endpoint operation set; the public
//! [`Endpoint`](crate::Endpoint) and [`Connection`](crate::Connection)
//! handles are thin dispatchers over it.
//!
//! Transports share the framework (the wire codec, the reliable engine,
//! the event machinery) and differ only where the hardware differs. The
//! reference UDP transport in [`udp`] implements the complete semantics
//! over unreliable datagrams; a hardware transport would replace the wire
//! layer and keep the contract.

use crate::config::DeviceProfile;
use crate::device::Device;
use crate::endpoint::{
    Attribute, ConnectionOption, EndpointOption, Flags, OptValue, RmaHandle, RmaRemoteHandle,
    WakeHandle,
};
use crate::event::{Event, EventInner};
use crate::status::Result;
use std::sync::Arc;
use std::time::Duration;

pub mod udp;

/// Capabilities a transport reports from `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCaps {
    /// Endpoint operations are safe to call from multiple threads.
    pub thread_safe: bool,
}

/// One instance per wire technology, registered at `init`.
pub trait Transport: Send + Sync {
    /// Transport tag matched against the `transport` configuration key.
    fn name(&self) -> &'static str;

    /// Verify the ABI and report capabilities.
    fn init(&self, abi_version: u32, flags: u32) -> Result<TransportCaps>;

    /// Claim matching configuration profiles and turn them into devices.
    /// With no profiles at all, contribute a built-in default device so a
    /// configless process can still communicate.
    fn enumerate(&self, profiles: &[DeviceProfile]) -> Vec<Device>;

    /// Create an endpoint bound to `device`, optionally at a fixed service
    /// (port). `endpoint_id` is the core-allocated process-unique ID.
    fn create_endpoint(
        &self,
        device: &Device,
        service: Option<u16>,
        endpoint_id: u32,
    ) -> Result<(Arc<dyn EndpointOps>, WakeHandle)>;
}

/// The per-endpoint operation set the core dispatches into.
///
/// Connections are named by their local 32-bit ID; every call revalidates
/// the ID against the endpoint's connection table and answers `Invalid` for
/// stale ones.
pub trait EndpointOps: Send + Sync {
    fn uri(&self) -> String;

    fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: Attribute,
        context: u64,
        flags: Flags,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Accept the embryonic connection behind a CONNECT_REQUEST event.
    fn accept(&self, request: u32, context: u64) -> Result<()>;

    /// Reject the embryonic connection behind a CONNECT_REQUEST event.
    fn reject(&self, request: u32) -> Result<()>;

    fn disconnect(&self, conn: u32) -> Result<()>;

    /// Gather send; `sendv` and `send` both land here.
    fn send(&self, conn: u32, iov: &[&[u8]], context: u64, flags: Flags) -> Result<()>;

    fn rma_register(&self, buf: Vec<u8>, protection: Flags) -> Result<RmaHandle>;

    fn rma_deregister(&self, token: u64) -> Result<Vec<u8>>;

    #[allow(clippy::too_many_arguments)]
    fn rma(
        &self,
        conn: u32,
        completion: Option<&[u8]>,
        local_token: u64,
        local_offset: u64,
        remote: &RmaRemoteHandle,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: Flags,
    ) -> Result<()>;

    fn get_event(&self) -> Result<Option<Event>>;

    fn return_event(&self, inner: Box<EventInner>) -> Result<()>;

    fn endpoint_set_opt(&self, option: EndpointOption, value: u64) -> Result<()>;

    fn endpoint_get_opt(&self, option: EndpointOption) -> Result<OptValue>;

    fn conn_set_opt(&self, conn: u32, option: ConnectionOption, value: u64) -> Result<()>;

    fn conn_get_opt(&self, conn: u32, option: ConnectionOption) -> Result<OptValue>;

    fn conn_attribute(&self, conn: u32) -> Result<Attribute>;

    fn conn_max_send_size(&self, conn: u32) -> Result<u32>;

    fn conn_context(&self, conn: u32) -> Result<u64>;

    fn arm_wake(&self) -> Result<()>;

    /// Tear the endpoint down: stop progress, fail in-flight work, release
    /// wire resources. Idempotent.
    fn close(&self);
}

/// The transports compiled into this build.
pub(crate) fn builtin_transports() -> Vec<Arc<dyn Transport>> {
    vec![Arc::new(udp::UdpTransport::new())]
}
