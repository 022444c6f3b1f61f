//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{ConnectionCounts, LoadBalancer};
use crate::registry::Instance;

/// Least connections selector.
/// Selects the instance with the minimum number of in-flight calls.
#[derive(Debug)]
pub struct LeastConnections {
    counts: Arc<ConnectionCounts>,
}

impl LeastConnections {
    pub fn new(counts: Arc<ConnectionCounts>) -> Self {
        Self { counts }
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server<'a>(&self, healthy: &[&'a Instance]) -> Option<&'a Instance> {
        // In case of tie, the first one is selected (stability)
        healthy
            .iter()
            .min_by_key(|i| self.counts.in_flight(&i.address))
            .copied()
    }
}
