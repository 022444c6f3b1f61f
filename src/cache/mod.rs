//! Multi-tier cache subsystem.
//!
//! # Data Flow
//! ```text
//! get_or_load(key, loader)
//!     → local.rs (in-process, expiring entries)
//!     → distributed.rs (shared tier, bounded by a timeout)
//!         → hit: promote into local tier
//!     → loader (the backend call)
//!         → success: write both tiers
//!         → failure: propagate, cache nothing
//! ```
//!
//! # Design Decisions
//! - Distributed-tier errors and timeouts are misses, never request failures
//! - Expired entries are unusable immediately; removal is lazy
//! - Concurrent loads of one key may both run; last write wins

pub mod distributed;
pub mod local;
pub mod tiered;

use thiserror::Error;

pub use distributed::{DistributedCache, RedisStore};
pub use local::LocalCache;
pub use tiered::TieredCache;

/// Errors from a distributed cache tier. They never reach callers of
/// [`TieredCache`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}
