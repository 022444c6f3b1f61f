//! Admission control subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (global token bucket, middleware)
//!     → routing (dynamic route matched)
//!     → rate_limit.rs (per-route token bucket, if configured)
//!     → Dispatcher
//! ```
//!
//! # Design Decisions
//! - Fail fast: rejected requests never queue and never touch a backend
//! - Rejection happens before any downstream state is read or written

pub mod rate_limit;

pub use rate_limit::{RateLimitError, TokenBucket};
