//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::load_balancer::LoadBalancer;
use crate::registry::Instance;

/// Round-robin selector.
/// Stores a monotonic cursor that wraps modulo the instance count.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server<'a>(&self, healthy: &[&'a Instance]) -> Option<&'a Instance> {
        if healthy.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[index])
    }
}
