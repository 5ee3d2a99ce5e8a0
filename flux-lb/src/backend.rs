use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

/// Health-check descriptor carried for diagnostic symmetry with the
/// control plane. The data plane never probes backends itself — it
/// only consumes the `healthy` flag, toggled by
/// `apply_backend_health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckDescriptor {
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub path: String,
}

/// A named upstream endpoint.
///
/// Backends are reference-counted (`Arc<Backend>`) and shared between
/// the current and next pool snapshot: health and connection-count
/// atomics carry across a `set_backends` call for addresses that
/// persist, so counters are never reset by an unrelated reconfiguration.
#[derive(Debug)]
pub struct Backend {
    pub address: String,
    pub weight: u32,
    pub health_check: HealthCheckDescriptor,
    healthy: AtomicBool,
    active_connections: AtomicU32,
    /// Smooth weighted round-robin running total. Only ever mutated
    /// while the owning `LoadBalancer`'s `wrr_lock` is held.
    wrr_current: AtomicI64,
}

impl Backend {
    pub fn new(address: String, weight: u32) -> Self {
        Self {
            address,
            weight,
            health_check: HealthCheckDescriptor::default(),
            healthy: AtomicBool::new(true),
            active_connections: AtomicU32::new(0),
            wrr_current: AtomicI64::new(0),
        }
    }

    pub fn with_health_check(mut self, hc: HealthCheckDescriptor) -> Self {
        self.health_check = hc;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn wrr_current(&self) -> i64 {
        self.wrr_current.load(Ordering::Relaxed)
    }

    pub(crate) fn wrr_add(&self, delta: i64) {
        self.wrr_current.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn wrr_set(&self, value: i64) {
        self.wrr_current.store(value, Ordering::Relaxed);
    }
}
