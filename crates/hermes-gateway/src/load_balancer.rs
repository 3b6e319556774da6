//! Load balancing strategies.
//!
//! Every strategy picks one target out of an ordered candidate list and
//! is safe to call from many in-flight requests at once. Round-robin is
//! a single atomic counter, random holds its generator behind a mutex,
//! and least-connections serializes all access to its count map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use hermes_state::LoadBalancerType;

use crate::error::{GatewayError, GatewayResult};

/// The candidate list was empty. Not retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no targets available")]
pub struct NoTargets;

/// Strategy for choosing an upstream target.
pub trait LoadBalancer: Send + Sync {
    fn next_target(&self, targets: &[String]) -> Result<String, NoTargets>;

    /// Called once the request sent to `target` has completed.
    fn release(&self, _target: &str) {}

    fn kind(&self) -> LoadBalancerType;
}

/// Build the strategy for `kind`.
pub fn new_load_balancer(kind: LoadBalancerType) -> GatewayResult<Box<dyn LoadBalancer>> {
    match kind {
        LoadBalancerType::RoundRobin => Ok(Box::new(RoundRobinBalancer::new())),
        LoadBalancerType::Random => Ok(Box::new(RandomBalancer::new())),
        LoadBalancerType::LeastConnections => Ok(Box::new(LeastConnectionsBalancer::new())),
        LoadBalancerType::WeightedRoundRobin => Err(GatewayError::UnsupportedBalancer(kind)),
    }
}

/// Lock-free round-robin over whatever list it is handed.
///
/// The counter is shared across calls regardless of the candidate list,
/// so only the list's length and order matter.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next_target(&self, targets: &[String]) -> Result<String, NoTargets> {
        if targets.is_empty() {
            return Err(NoTargets);
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % targets.len();
        Ok(targets[idx].clone())
    }

    fn kind(&self) -> LoadBalancerType {
        LoadBalancerType::RoundRobin
    }
}

/// Uniform random choice.
pub struct RandomBalancer {
    rng: Mutex<StdRng>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic sequence, for tests and reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RandomBalancer {
    fn next_target(&self, targets: &[String]) -> Result<String, NoTargets> {
        if targets.is_empty() {
            return Err(NoTargets);
        }
        let idx = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0..targets.len());
        Ok(targets[idx].clone())
    }

    fn kind(&self) -> LoadBalancerType {
        LoadBalancerType::Random
    }
}

/// Picks the target with the fewest open requests.
///
/// Ties go to the earliest candidate in the list. Counts only go back
/// down through [`LoadBalancer::release`].
pub struct LeastConnectionsBalancer {
    connections: Mutex<HashMap<String, usize>>,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Open requests currently counted against `target`.
    pub fn connections(&self, target: &str) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for LeastConnectionsBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn next_target(&self, targets: &[String]) -> Result<String, NoTargets> {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<(&String, usize)> = None;
        for target in targets {
            let count = *connections.entry(target.clone()).or_insert(0);
            if best.is_none_or(|(_, min)| count < min) {
                best = Some((target, count));
            }
        }

        let (target, _) = best.ok_or(NoTargets)?;
        *connections.entry(target.clone()).or_insert(0) += 1;
        Ok(target.clone())
    }

    fn release(&self, target: &str) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = connections.get_mut(target) {
            *count = count.saturating_sub(1);
        }
    }

    fn kind(&self) -> LoadBalancerType {
        LoadBalancerType::LeastConnections
    }
}
