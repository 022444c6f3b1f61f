//! Uniform random load balancing strategy.

use rand::seq::SliceRandom;

use crate::load_balancer::LoadBalancer;
use crate::registry::Instance;

/// Stateless uniform pick.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPick;

impl LoadBalancer for RandomPick {
    fn next_server<'a>(&self, healthy: &[&'a Instance]) -> Option<&'a Instance> {
        healthy.choose(&mut rand::thread_rng()).copied()
    }
}
