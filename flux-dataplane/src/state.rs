//! `ProxyState`: the shared object every acceptor, handler, and
//! maintenance task borrows. Owns the atomically-published
//! configuration snapshot, the backend pool, and the three policy
//! objects (load balancer, circuit breaker, rate limiter) plus the NAT
//! table and metrics registry.

use crate::config::ProxyConfig;
use crate::metrics::MetricsRegistry;
use crate::nat::NatTable;
use crate::breaker::CircuitBreaker;
use crate::ratelimit::RateLimiter;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use flux_core::Result;
use flux_lb::{Backend, LoadBalancer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ProxyState {
    config: ArcSwap<ProxyConfig>,
    pub lb: LoadBalancer,
    pub breaker: CircuitBreaker,
    pub rate_limiter: ArcSwap<RateLimiter>,
    pub nat: NatTable,
    pub metrics: Arc<MetricsRegistry>,
    backends_by_address: DashMap<String, Arc<Backend>>,
    draining: AtomicBool,
    /// Notified whenever the listen addresses change, so the TCP/UDP
    /// acceptor tasks can rebind without an acceptance gap.
    pub listen_changed: Notify,
    last_listen: Mutex<crate::config::ListenConfig>,
    /// Cancelled the moment a drain begins; handler tasks select on this
    /// to learn they should finish up within the deadline.
    pub drain_token: CancellationToken,
    pub active_tcp_connections: AtomicU64,
    pub connections_aborted_by_drain: AtomicU64,
    /// Set the moment a drain begins; handler tasks race their relay
    /// against this instant and force-close once it passes.
    drain_deadline: Mutex<Option<tokio::time::Instant>>,
}

impl ProxyState {
    pub fn new(initial: ProxyConfig) -> Arc<Self> {
        let lb = LoadBalancer::new(initial.load_balancing.algorithm);
        let breaker = CircuitBreaker::new(
            initial.circuit_breaker.error_threshold,
            initial.circuit_breaker.timeout,
        );
        let rate_limiter = RateLimiter::new(
            initial.rate_limit.requests_per_second,
            initial.rate_limit.burst,
        );

        let state = Arc::new(Self {
            config: ArcSwap::from_pointee(initial.clone()),
            lb,
            breaker,
            rate_limiter: ArcSwap::from_pointee(rate_limiter),
            nat: NatTable::new(Duration::from_secs(60)),
            metrics: Arc::new(MetricsRegistry::new()),
            backends_by_address: DashMap::new(),
            draining: AtomicBool::new(false),
            listen_changed: Notify::new(),
            last_listen: Mutex::new(initial.listen.clone()),
            drain_token: CancellationToken::new(),
            active_tcp_connections: AtomicU64::new(0),
            connections_aborted_by_drain: AtomicU64::new(0),
            drain_deadline: Mutex::new(None),
        });

        state.rebuild_backend_pool(&initial);
        state
    }

    pub fn current(&self) -> Arc<ProxyConfig> {
        self.config.load_full()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Stops admitting new flows and marks the instant in-flight
    /// handlers must abort by. TCP/UDP handlers race their relay
    /// against this deadline once they observe `drain_token` cancelled.
    pub fn begin_drain(&self, timeout: Duration) {
        self.draining.store(true, Ordering::Release);
        *self.drain_deadline.lock().unwrap() = Some(tokio::time::Instant::now() + timeout);
        self.drain_token.cancel();
    }

    pub fn drain_deadline(&self) -> Option<tokio::time::Instant> {
        *self.drain_deadline.lock().unwrap()
    }

    /// Replaces the full snapshot. New backend addresses start with a
    /// closed breaker and zeroed counters; addresses removed from the
    /// pool are simply dropped from the selectable set — flows already
    /// in progress hold their own `Arc<ProxyConfig>` clone from
    /// `current()` and are unaffected.
    pub fn apply_config(&self, next: ProxyConfig) -> Result<()> {
        self.lb.set_algorithm(next.load_balancing.algorithm);
        self.breaker.reconfigure(
            next.circuit_breaker.error_threshold,
            next.circuit_breaker.timeout,
        );

        let new_limiter = self
            .rate_limiter
            .load()
            .reconfigure(next.rate_limit.requests_per_second, next.rate_limit.burst);
        self.rate_limiter.store(Arc::new(new_limiter));

        self.rebuild_backend_pool(&next);

        {
            let mut last_listen = self.last_listen.lock().unwrap();
            if last_listen.tcp_address != next.listen.tcp_address
                || last_listen.udp_address != next.listen.udp_address
            {
                info!(
                    old_tcp = %last_listen.tcp_address,
                    new_tcp = %next.listen.tcp_address,
                    "listen address changed, acceptors will rebind"
                );
                *last_listen = next.listen.clone();
                self.listen_changed.notify_waiters();
            }
        }

        self.config.store(Arc::new(next));
        Ok(())
    }

    /// Toggles `healthy` on existing backends without rebuilding the
    /// pool or touching the breaker/counter state.
    pub fn apply_backend_health(&self, health: &std::collections::HashMap<String, bool>) {
        for (address, healthy) in health {
            if let Some(backend) = self.backends_by_address.get(address) {
                backend.set_healthy(*healthy);
            }
        }
    }

    fn rebuild_backend_pool(&self, config: &ProxyConfig) {
        let mut next_backends = Vec::with_capacity(config.backends.len());
        for spec in &config.backends {
            let backend = self
                .backends_by_address
                .get(&spec.address)
                .map(|existing| existing.clone())
                .unwrap_or_else(|| {
                    Arc::new(
                        Backend::new(spec.address.clone(), spec.weight)
                            .with_health_check(spec.health_check.clone()),
                    )
                });
            backend.set_healthy(spec.healthy);
            self.metrics.register_backend(&spec.address);
            next_backends.push(backend);
        }

        self.backends_by_address.clear();
        for backend in &next_backends {
            self.backends_by_address
                .insert(backend.address.clone(), backend.clone());
        }

        self.lb.set_backends(next_backends);
    }
}
