//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     GatewayConfig → registry → balancer → breakers → cache → dispatcher
//!         → inventory → rate limiter → Gateway
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → server drains, refresher exits
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Components are constructed explicitly and passed by reference; no globals
//! - Fail fast on unusable configuration, degrade on unreachable dependencies
//!   (Redis, registry prefetch)

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Gateway, StartupError};
