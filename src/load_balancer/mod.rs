//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher holds an InstanceSet for a service
//!     → Balancer::select (drop unhealthy instances)
//!     → Apply the configured algorithm:
//!         - random.rs (uniform pick)
//!         - round_robin.rs (per-service rotating cursor)
//!         - least_conn.rs (fewest in-flight calls)
//!     → connections.rs (in-flight guard held for the call)
//! ```
//!
//! # Design Decisions
//! - Unhealthy instances are filtered before any algorithm runs
//! - Algorithm chosen once at configuration time
//! - One algorithm instance per service so cursors do not interfere
//! - Selection never blocks and is O(n) in instance count

pub mod connections;
pub mod least_conn;
pub mod random;
pub mod round_robin;

use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::config::BalancePolicy;
use crate::registry::Instance;

pub use connections::{ConnectionCounts, InFlightGuard};
use least_conn::LeastConnections;
use random::RandomPick;
use round_robin::RoundRobin;

/// Selection algorithm over the healthy instances of one service.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick one of `healthy`, which is never empty.
    fn next_server<'a>(&self, healthy: &[&'a Instance]) -> Option<&'a Instance>;
}

/// Errors raised by instance selection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("service {0} has no instances")]
    NoInstances(String),

    #[error("service {0} has no healthy instance")]
    NoHealthyInstance(String),
}

/// Chooses an instance per service under the configured policy.
#[derive(Debug)]
pub struct Balancer {
    policy: BalancePolicy,
    connections: Arc<ConnectionCounts>,
    per_service: DashMap<String, Arc<dyn LoadBalancer>>,
}

impl Balancer {
    pub fn new(policy: BalancePolicy) -> Self {
        Self {
            policy,
            connections: Arc::new(ConnectionCounts::default()),
            per_service: DashMap::new(),
        }
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    fn algorithm(&self, service: &str) -> Arc<dyn LoadBalancer> {
        if let Some(lb) = self.per_service.get(service) {
            return lb.value().clone();
        }
        self.per_service
            .entry(service.to_string())
            .or_insert_with(|| -> Arc<dyn LoadBalancer> {
                match self.policy {
                    BalancePolicy::Random => Arc::new(RandomPick),
                    BalancePolicy::RoundRobin => Arc::new(RoundRobin::new()),
                    BalancePolicy::LeastConnections => {
                        Arc::new(LeastConnections::new(self.connections.clone()))
                    }
                }
            })
            .value()
            .clone()
    }

    /// Select a healthy instance of `service` from `instances`.
    pub fn select(&self, service: &str, instances: &[Instance]) -> Result<Instance, SelectionError> {
        if instances.is_empty() {
            return Err(SelectionError::NoInstances(service.to_string()));
        }

        let healthy: Vec<&Instance> = instances.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            tracing::debug!(service = %service, total = instances.len(), "All instances unhealthy");
            return Err(SelectionError::NoHealthyInstance(service.to_string()));
        }

        self.algorithm(service)
            .next_server(&healthy)
            .cloned()
            .ok_or_else(|| SelectionError::NoHealthyInstance(service.to_string()))
    }

    /// Count a call against `instance` until the guard drops.
    pub fn track(&self, instance: &Instance) -> InFlightGuard {
        self.connections.track(&instance.address)
    }

    pub fn connections(&self) -> &ConnectionCounts {
        &self.connections
    }
}
