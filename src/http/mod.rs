//! HTTP surface subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, request id, tracing, timeout)
//!     → global token bucket
//!     → built-in handlers (/health, /inventory/{product_id})
//!       or a configured route
//!         → per-route token bucket
//!         → Dispatcher (cached or pass-through)
//!     → Send to client
//! ```

pub mod server;

pub use server::{AppState, GatewayServer};
