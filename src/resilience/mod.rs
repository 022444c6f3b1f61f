//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a backend service:
//!     → circuit_breaker.rs (admit or fail fast, per service)
//!     → timeouts.rs (enforce the forward deadline)
//!     → circuit_breaker.rs (record the outcome exactly once)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every downstream call has a deadline
//! - A timed-out call is a breaker failure
//! - No automatic retries: one forward attempt per inbound request

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{BreakerError, BreakerPermit, BreakerState, CircuitBreakers};
