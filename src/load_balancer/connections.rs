//! In-flight call tracking per instance address.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Number of calls currently running against each instance.
#[derive(Debug, Default)]
pub struct ConnectionCounts {
    counts: DashMap<String, Arc<AtomicUsize>>,
}

impl ConnectionCounts {
    fn counter(&self, address: &str) -> Arc<AtomicUsize> {
        if let Some(counter) = self.counts.get(address) {
            return counter.value().clone();
        }
        self.counts
            .entry(address.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Current in-flight count for `address`.
    pub fn in_flight(&self, address: &str) -> usize {
        self.counts
            .get(address)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Increment the count; the returned guard decrements it on drop.
    pub fn track(&self, address: &str) -> InFlightGuard {
        let counter = self.counter(address);
        counter.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter }
    }
}

/// A RAII guard that manages the in-flight count of one instance.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
