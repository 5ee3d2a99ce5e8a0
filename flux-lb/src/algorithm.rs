use crate::backend::Backend;
use crate::error::LbError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Selection algorithm. Algorithm strings in the wire config are
/// authoritative — an unknown name is a configuration error, never a
/// silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    RoundRobin,
    Weighted,
    LeastConnections,
    ConsistentHash,
}

impl FromStr for Algorithm {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "weighted" => Ok(Algorithm::Weighted),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "consistent_hash" => Ok(Algorithm::ConsistentHash),
            other => Err(LbError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Smooth weighted round-robin: each backend's `current` accumulates
/// its weight every round; the backend with the greatest `current` is
/// picked and has the pool's total weight subtracted, which is what
/// makes the schedule interleave instead of bursting through one
/// high-weight backend before moving on.
pub(crate) fn weighted_select(healthy: &[Arc<Backend>]) -> Arc<Backend> {
    let total_weight: i64 = healthy.iter().map(|b| b.weight as i64).sum();

    let mut best_idx = 0;
    let mut best_current = i64::MIN;
    for (i, b) in healthy.iter().enumerate() {
        let current = b.wrr_current() + b.weight as i64;
        b.wrr_set(current);
        if current > best_current {
            best_current = current;
            best_idx = i;
        }
    }

    healthy[best_idx].wrr_add(-total_weight);
    healthy[best_idx].clone()
}

/// Smallest active-connection count; ties broken by lowest index.
pub(crate) fn least_connections_select(healthy: &[Arc<Backend>]) -> Arc<Backend> {
    let mut best_idx = 0;
    let mut best_count = u32::MAX;
    for (i, b) in healthy.iter().enumerate() {
        let count = b.active_connections();
        if count < best_count {
            best_count = count;
            best_idx = i;
        }
    }
    healthy[best_idx].clone()
}
