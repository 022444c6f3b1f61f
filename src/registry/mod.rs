//! Service registry subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher asks for a service
//!     → client.rs (snapshot per service, atomic swap)
//!         → snapshot present: return it, even if stale
//!         → no snapshot yet: fetch once via backend
//!     → backend.rs / nacos.rs (list_instances)
//!
//! Background refresher:
//!     Periodic timer → refresh every known service → swap snapshot
//!     Refresh failure → log, keep previous snapshot
//! ```
//!
//! # Design Decisions
//! - Snapshots are replaced wholesale (ArcSwap), never edited in place
//! - Readers never block on a refresh
//! - At most one refresh in flight per service

pub mod backend;
pub mod client;
pub mod nacos;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use backend::{RegistryBackend, StaticRegistry};
pub use client::RegistryClient;
pub use nacos::NacosRegistry;

/// One concrete reachable endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    /// Base URL of the instance, e.g. "http://10.0.0.4:8080".
    pub address: String,
    pub healthy: bool,
}

impl Instance {
    pub fn healthy(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            healthy: true,
        }
    }

    pub fn unhealthy(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            healthy: false,
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Immutable view of a service's instances at one point in time.
pub type InstanceSet = Arc<Vec<Instance>>;

/// Errors raised while resolving a service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No snapshot has ever been obtained for the service.
    #[error("service {0} could not be resolved")]
    Unresolved(String),

    /// The registry backend failed to answer.
    #[error("registry backend error: {0}")]
    Backend(String),

    /// The registry backend did not answer in time.
    #[error("registry backend timed out after {0}ms")]
    Timeout(u64),
}
