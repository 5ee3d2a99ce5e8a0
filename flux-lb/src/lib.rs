//! Pluggable load-balancer selection over a pool of healthy backends.
//!
//! Grounded on `brivas-core::xdp::{XdpController, BackendPool,
//! HashAlgorithm}` (same domain model: a named backend pool, a
//! selectable hash/selection algorithm, per-backend health and
//! connection-count atomics) and on the corpus reference
//! `layer4-lb::core::balancer::LoadBalancer`, which holds its backend
//! list behind `Arc<ArcSwap<Vec<Arc<Backend>>>>` for a lock-free,
//! wait-free read path — the same technique used here.

mod algorithm;
mod backend;
mod consistent_hash;
mod error;

pub use algorithm::Algorithm;
pub use backend::{Backend, HealthCheckDescriptor};
pub use error::LbError;

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use consistent_hash::HashRing;

/// The selection context a caller supplies for one flow.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub client_ip: IpAddr,
}

/// Selects one backend from the current pool using the configured
/// algorithm. Safe for concurrent selection from many tasks.
pub struct LoadBalancer {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    algorithm: ArcSwap<Algorithm>,
    rr_counter: AtomicUsize,
    ring: ArcSwap<HashRing>,
    // Smooth weighted round-robin mutates several backends' `current`
    // counters as one group; a short critical section keeps that step
    // atomic without needing a lock across every backend individually.
    wrr_lock: Mutex<()>,
}

impl LoadBalancer {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            algorithm: ArcSwap::from_pointee(algorithm),
            rr_counter: AtomicUsize::new(0),
            ring: ArcSwap::from_pointee(HashRing::default()),
            wrr_lock: Mutex::new(()),
        }
    }

    /// Replaces the backend set. Rebuilds the consistent-hash ring
    /// (only needed when membership changes, not on a health toggle).
    pub fn set_backends(&self, backends: Vec<Arc<Backend>>) {
        let ring = HashRing::build(&backends);
        self.backends.store(Arc::new(backends));
        self.ring.store(Arc::new(ring));
    }

    pub fn set_algorithm(&self, algorithm: Algorithm) {
        self.algorithm.store(Arc::new(algorithm));
    }

    pub fn algorithm(&self) -> Algorithm {
        **self.algorithm.load()
    }

    pub fn backends(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    /// Looks up a backend by address in the current pool.
    pub fn find(&self, address: &str) -> Option<Arc<Backend>> {
        self.backends
            .load()
            .iter()
            .find(|b| b.address == address)
            .cloned()
    }

    pub fn select(&self, ctx: &SelectionContext) -> Result<Arc<Backend>, LbError> {
        self.select_excluding(ctx, &HashSet::new())
    }

    /// Selects a backend, skipping any address in `excluded`. Used by
    /// the TCP/UDP engines to retry with another backend after a
    /// circuit-breaker denial or connect failure.
    pub fn select_excluding(
        &self,
        ctx: &SelectionContext,
        excluded: &HashSet<String>,
    ) -> Result<Arc<Backend>, LbError> {
        let backends = self.backends.load();
        let healthy: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.is_healthy() && !excluded.contains(&b.address))
            .cloned()
            .collect();

        if healthy.is_empty() {
            return Err(LbError::NoBackendsAvailable);
        }

        match self.algorithm() {
            Algorithm::RoundRobin => {
                let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Ok(healthy[idx].clone())
            }
            Algorithm::Weighted => {
                let _guard = self.wrr_lock.lock().unwrap();
                Ok(algorithm::weighted_select(&healthy))
            }
            Algorithm::LeastConnections => Ok(algorithm::least_connections_select(&healthy)),
            Algorithm::ConsistentHash => {
                let ring = self.ring.load();
                ring.select(ctx.client_ip, &healthy)
                    .ok_or(LbError::NoBackendsAvailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn backend(addr: &str, weight: u32) -> Arc<Backend> {
        Arc::new(Backend::new(addr.to_string(), weight))
    }

    fn ctx() -> SelectionContext {
        SelectionContext {
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let lb = LoadBalancer::new(Algorithm::RoundRobin);
        lb.set_backends(vec![backend("a", 1), backend("b", 1), backend("c", 1)]);

        let mut order = Vec::new();
        for _ in 0..9 {
            order.push(lb.select(&ctx()).unwrap().address.clone());
        }
        assert_eq!(
            order,
            vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_pool_is_no_backends_available() {
        let lb = LoadBalancer::new(Algorithm::RoundRobin);
        lb.set_backends(vec![]);
        assert!(matches!(
            lb.select(&ctx()),
            Err(LbError::NoBackendsAvailable)
        ));
    }

    #[test]
    fn unhealthy_backend_is_never_selected() {
        let lb = LoadBalancer::new(Algorithm::RoundRobin);
        let unhealthy = backend("a", 1);
        unhealthy.set_healthy(false);
        lb.set_backends(vec![unhealthy, backend("b", 1)]);

        for _ in 0..10 {
            assert_eq!(lb.select(&ctx()).unwrap().address, "b");
        }
    }

    #[test]
    fn all_unhealthy_is_no_backends_available() {
        let lb = LoadBalancer::new(Algorithm::RoundRobin);
        let a = backend("a", 1);
        a.set_healthy(false);
        lb.set_backends(vec![a]);
        assert!(matches!(
            lb.select(&ctx()),
            Err(LbError::NoBackendsAvailable)
        ));
    }

    #[test]
    fn select_excluding_skips_named_backend() {
        let lb = LoadBalancer::new(Algorithm::RoundRobin);
        lb.set_backends(vec![backend("a", 1), backend("b", 1)]);
        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());
        for _ in 0..5 {
            assert_eq!(lb.select_excluding(&ctx(), &excluded).unwrap().address, "b");
        }
    }
}
