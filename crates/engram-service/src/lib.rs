//! # Engram Service
//!
//! The logical, transport-agnostic request/response layer over
//! [`engram_core`]. A transport (stdio JSON-RPC, HTTP, a test harness)
//! frames bytes into [`Request`] values and writes back [`Response`]
//! values. Everything in between lives here: parameter validation,
//! dispatch, per-operation timeouts, cancellation, and the error object
//! mapping.

mod dispatch;
mod protocol;

pub use dispatch::{MemoryService, ServiceTimeouts};
pub use protocol::{ErrorObject, Request, Response};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global tracing subscriber. Transports call this once at
/// startup; `ENGRAM_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("ENGRAM_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
