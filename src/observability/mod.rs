//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Pipeline components emit:
//!     → logging.rs (tracing events with structured fields)
//!     → metrics.rs (admission, breaker, cache and registry counters)
//!
//! Exported as:
//!     → stdout, pretty or JSON
//!     → Prometheus scrape endpoint when enabled
//! ```
//!
//! # Design Decisions
//! - Log fields name the service and instance involved
//! - The request id set at the edge is propagated to upstreams
//! - Recording is a no-op until a recorder is installed

pub mod logging;
pub mod metrics;
