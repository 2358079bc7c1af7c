//! # Status Taxonomy
//!
//! This module defines the stable set of status codes shared by every
//! transport. All fallible library calls return `Result<T, Status>`, and
//! asynchronous outcomes (send completions, connection establishment,
//! keepalive expiry) carry a `Status` inside the corresponding event.
//!
//! ## Design Considerations
//!
//! - **Stable across transports**: a given failure kind means the same thing
//!   no matter which transport produced it
//! - **Synchronous vs asynchronous**: argument problems are reported from the
//!   call itself; wire-level outcomes surface only through events
//! - **Static messages**: [`strerror`] returns a `&'static str` so callers
//!   can log a status without allocating

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Status>;

/// Stable status codes shared by the core and every transport.
///
/// `Success` exists because events report it; API calls never return it in
/// the error position.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Normal completion.
    #[error("success")]
    Success,

    /// Bad argument: null-equivalent handle, wrong attribute, wrong flag
    /// combination, or an operation against a stale ID.
    #[error("invalid argument")]
    Invalid,

    /// Allocation failure.
    #[error("out of memory")]
    NoMemory,

    /// The named device is missing or not up.
    #[error("no such device")]
    NoDevice,

    /// TX/RX descriptor pool or OS queue exhausted.
    #[error("out of buffer space")]
    NoBufferSpace,

    /// A reliable send or a connect ran past its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The peer or the local side tore the connection down.
    #[error("connection disconnected")]
    Disconnected,

    /// The receiver stayed out of RX buffers for the full send timeout.
    #[error("receiver not ready")]
    Rnr,

    /// The passive side rejected the connection request.
    #[error("connection refused")]
    ConnRefused,

    /// The remote side did not recognise (or did not authorise) the RMA
    /// handle named by an operation.
    #[error("unknown RMA handle")]
    RmaHandle,

    /// The remote transport cannot perform the requested RMA variant.
    #[error("unsupported RMA operation")]
    RmaOp,

    /// The device failed irrecoverably.
    #[error("device failed")]
    DeviceDead,

    /// The feature is not supported by this transport.
    #[error("not implemented")]
    NotImplemented,

    /// A configuration file or resource was not found.
    #[error("not found")]
    NotFound,

    /// Last-resort failure with no more specific kind.
    #[error("generic failure")]
    Generic,
}

impl Status {
    /// Static message for this status, identical to its `Display` output.
    pub const fn message(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Invalid => "invalid argument",
            Status::NoMemory => "out of memory",
            Status::NoDevice => "no such device",
            Status::NoBufferSpace => "out of buffer space",
            Status::TimedOut => "operation timed out",
            Status::Disconnected => "connection disconnected",
            Status::Rnr => "receiver not ready",
            Status::ConnRefused => "connection refused",
            Status::RmaHandle => "unknown RMA handle",
            Status::RmaOp => "unsupported RMA operation",
            Status::DeviceDead => "device failed",
            Status::NotImplemented => "not implemented",
            Status::NotFound => "not found",
            Status::Generic => "generic failure",
        }
    }
}

/// Map a status to its static description.
pub fn strerror(status: Status) -> &'static str {
    status.message()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every status renders the same text through Display and strerror.
    #[test]
    fn display_matches_strerror() {
        let all = [
            Status::Success,
            Status::Invalid,
            Status::NoMemory,
            Status::NoDevice,
            Status::NoBufferSpace,
            Status::TimedOut,
            Status::Disconnected,
            Status::Rnr,
            Status::ConnRefused,
            Status::RmaHandle,
            Status::RmaOp,
            Status::DeviceDead,
            Status::NotImplemented,
            Status::NotFound,
            Status::Generic,
        ];
        for status in all {
            assert_eq!(status.to_string(), strerror(status));
        }
    }

    #[test]
    fn statuses_are_distinct() {
        assert_ne!(Status::Rnr, Status::TimedOut);
        assert_ne!(strerror(Status::Rnr), strerror(Status::TimedOut));
    }
}
