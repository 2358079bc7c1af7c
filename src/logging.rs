//! Tracing bootstrap for binaries and tests.
//!
//! The library itself only emits `tracing` events; wiring them to an output
//! is the embedding application's business. This helper builds a sensible
//! subscriber for processes that do not bring their own.

use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log filter, e.g. `CCI_LOG=debug` or
/// `CCI_LOG=cci::transport=trace`.
pub const LOG_ENV: &str = "CCI_LOG";

/// Install a global subscriber reading its filter from `CCI_LOG` (default:
/// warnings only). Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
