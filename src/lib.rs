//! # Common Communications Interface
//!
//! A transport-agnostic messaging layer for high-performance computing.
//! Applications program against a small set of primitives (connect, send a
//! short message, remote memory access, poll for events) and the runtime
//! dispatches them through a pluggable wire transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ Application │──▶│  Endpoint /    │──▶│  Transport plugin │
//! │   threads   │   │  Connection    │   │  (UDP reference,  │
//! │             │◀──│  dispatch      │◀──│   hardware, ...)  │
//! └─────────────┘   └────────────────┘   └──────────────────┘
//! ```
//!
//! The reference transport implements full semantics over unreliable
//! datagrams: a three-way connection handshake, sliding-window reliability
//! with cumulative and selective acknowledgement, receiver-not-ready
//! back-pressure, RMA read/write with remote completion messages, a
//! lease-based event queue, and a non-blocking progress engine.
//!
//! ## Quick tour
//!
//! ```no_run
//! use cci::{Attribute, Flags};
//!
//! let _caps = cci::init(cci::ABI_VERSION, 0)?;
//! let (endpoint, _wake) = cci::create_endpoint(None, 0)?;
//! endpoint.connect("udp://10.0.0.1:5555", b"hello", Attribute::Ru, 1, Flags::NONE, None)?;
//! while let Some(mut event) = endpoint.get_event()? {
//!     // ... react to event.kind() ...
//!     endpoint.return_event(&mut event)?;
//! }
//! # Ok::<(), cci::Status>(())
//! ```
//!
//! Progress happens under polling callers (and an optional per-endpoint
//! helper thread); no operation suspends a thread implicitly. Blocking
//! waits belong to the application, via the [`WakeHandle`] returned at
//! endpoint creation.

pub mod config;
pub mod device;
pub mod endpoint;
pub mod event;
pub mod id_pool;
pub mod logging;
pub mod status;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use device::{Device, PciAddress};
pub use endpoint::{
    Attribute, Caps, Connection, ConnectionOption, Endpoint, EndpointOption, Flags, OptValue,
    RmaHandle, RmaRemoteHandle, WakeHandle, RMA_DESCRIPTOR_LEN,
};
pub use event::{Event, EventKind};
pub use status::{strerror, Result, Status};
pub use transport::{EndpointOps, Transport, TransportCaps};

use device::pick_default;
use id_pool::IdPool;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ABI generation verified by [`init`] and by every transport.
pub const ABI_VERSION: u32 = 2;

/// Maximum opaque payload carried by a connection request.
pub const CONN_REQ_LEN: usize = 1024;

/// Default configuration values shared by the transports.
pub mod defaults {
    use std::time::Duration;

    /// Reliable send deadline when neither the connection nor the endpoint
    /// sets one.
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

    /// Connect/accept deadline when the caller does not supply one.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// TX descriptor pool size per endpoint.
    pub const SEND_BUF_COUNT: usize = 128;

    /// RX slot pool size per endpoint.
    pub const RECV_BUF_COUNT: usize = 128;

    /// Standalone-ACK pacing per connection.
    pub const ACK_DELAY: Duration = Duration::from_millis(1);

    /// First retransmit delay; doubles per resend.
    pub const RETRANSMIT_BASE: Duration = Duration::from_millis(1);

    /// Retransmit backoff ceiling.
    pub const RETRANSMIT_CEILING: Duration = Duration::from_millis(128);

    /// Datagram budget per packet when a device does not set `mtu`.
    pub const MTU: u32 = 8192;
}

struct Globals {
    flags: u32,
    caps: Caps,
    refs: u32,
    devices: Vec<Device>,
    transports: Vec<Arc<dyn Transport>>,
    endpoints: Vec<Weak<dyn EndpointOps>>,
    endpoint_ids: IdPool,
}

static GLOBALS: Mutex<Option<Globals>> = Mutex::new(None);

/// Initialise the library: verify the ABI, load the configuration named by
/// `CCI_CONFIG` (a missing file is tolerated; transports then contribute
/// built-in default devices), and enumerate devices through every
/// registered transport.
///
/// Repeated calls are reference-counted. A later call whose flags are a
/// subset of the first call's is a no-op returning the cached capabilities;
/// new flag bits fail with `Invalid`.
pub fn init(abi_version: u32, flags: u32) -> Result<Caps> {
    if abi_version != ABI_VERSION {
        return Err(Status::Invalid);
    }
    let mut globals = GLOBALS.lock();
    if let Some(state) = globals.as_mut() {
        if flags & !state.flags != 0 {
            return Err(Status::Invalid);
        }
        state.refs += 1;
        return Ok(state.caps);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(Status::NotFound) => Config::default(),
        Err(err) => return Err(err),
    };
    let transports = transport::builtin_transports();
    let mut thread_safe = true;
    let mut devices = Vec::new();
    for transport in &transports {
        let caps = transport.init(abi_version, flags)?;
        thread_safe &= caps.thread_safe;
        devices.extend(transport.enumerate(&config.profiles));
    }
    device::order_devices(&mut devices);
    debug!(devices = devices.len(), "library initialised");

    let caps = Caps { thread_safe };
    *globals = Some(Globals {
        flags,
        caps,
        refs: 1,
        devices,
        transports,
        endpoints: Vec::new(),
        endpoint_ids: IdPool::new(),
    });
    Ok(caps)
}

/// Tear the library down once the last [`init`] reference is released.
/// Fails with `Invalid` while endpoints are still alive.
pub fn finalize() -> Result<()> {
    let mut globals = GLOBALS.lock();
    let state = globals.as_mut().ok_or(Status::Invalid)?;
    if state.refs > 1 {
        state.refs -= 1;
        return Ok(());
    }
    state.endpoints.retain(|weak| weak.strong_count() > 0);
    if !state.endpoints.is_empty() {
        return Err(Status::Invalid);
    }
    *globals = None;
    debug!("library finalised");
    Ok(())
}

/// The devices enumerated at [`init`], ordered by descending priority.
pub fn devices() -> Result<Vec<Device>> {
    GLOBALS
        .lock()
        .as_ref()
        .map(|state| state.devices.clone())
        .ok_or(Status::Invalid)
}

/// Create an endpoint on `device`, or on the default device when `None`:
/// the device marked `default = 1`, else the highest-priority device that
/// is up. Returns the endpoint handle and the pollable wake handle.
pub fn create_endpoint(device: Option<&Device>, flags: u32) -> Result<(Endpoint, WakeHandle)> {
    create_endpoint_inner(device, None, flags)
}

/// [`create_endpoint`] bound to a fixed service (for the UDP transport, the
/// local port).
pub fn create_endpoint_at(
    device: &Device,
    service: u16,
    flags: u32,
) -> Result<(Endpoint, WakeHandle)> {
    create_endpoint_inner(Some(device), Some(service), flags)
}

fn create_endpoint_inner(
    device: Option<&Device>,
    service: Option<u16>,
    _flags: u32,
) -> Result<(Endpoint, WakeHandle)> {
    let (transport, device, endpoint_id) = {
        let mut globals = GLOBALS.lock();
        let state = globals.as_mut().ok_or(Status::Invalid)?;
        let device = match device {
            Some(requested) => state
                .devices
                .iter()
                .find(|d| d.name == requested.name)
                .ok_or(Status::NoDevice)?
                .clone(),
            None => pick_default(&state.devices).ok_or(Status::NoDevice)?.clone(),
        };
        if !device.up {
            return Err(Status::NoDevice);
        }
        let transport = state
            .transports
            .iter()
            .find(|t| t.name() == device.transport)
            .cloned()
            .ok_or(Status::NoDevice)?;
        let endpoint_id = state.endpoint_ids.alloc().ok_or(Status::NoMemory)?;
        (transport, device, endpoint_id)
    };

    // Bind sockets and spawn the progress helper outside the registry lock.
    match transport.create_endpoint(&device, service, endpoint_id) {
        Ok((ops, wake)) => {
            let mut globals = GLOBALS.lock();
            if let Some(state) = globals.as_mut() {
                state.endpoints.retain(|weak| weak.strong_count() > 0);
                state.endpoints.push(Arc::downgrade(&ops));
            }
            Ok((Endpoint { ops }, wake))
        }
        Err(err) => {
            release_endpoint_id(endpoint_id);
            Err(err)
        }
    }
}

/// Return a process-unique endpoint ID to the pool; called by transports at
/// endpoint teardown.
pub(crate) fn release_endpoint_id(id: u32) {
    if let Some(state) = GLOBALS.lock().as_mut() {
        state.endpoint_ids.free(id);
        state.endpoints.retain(|weak| weak.strong_count() > 0);
    }
}
