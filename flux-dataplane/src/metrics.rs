//! Process-wide metrics registry: atomic counters/gauges plus a
//! bounded-memory latency estimator, read by the RPC layer to stream
//! `MetricsData` snapshots to the control plane.
//!
//! Counters are cumulative since process start; the registry never
//! resets on read — a reset would reorder deltas for a consumer that
//! retries a dropped `StreamMetrics` tick.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MetricsRegistry {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latency: LatencyEstimator,
    backends: DashMap<String, BackendMetrics>,
    pub rejected_rate_limited: AtomicU64,
    pub rejected_no_backend: AtomicU64,
    pub nat_sweeps: AtomicU64,
    pub nat_sessions_evicted: AtomicU64,
}

#[derive(Default)]
struct BackendMetrics {
    active_connections: AtomicI64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    latency: LatencyEstimator,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_backend(&self, address: &str) {
        self.backends
            .entry(address.to_string())
            .or_insert_with(BackendMetrics::default);
    }

    pub fn on_connection_opened(&self, backend: &str) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        if let Some(b) = self.backends.get(backend) {
            b.active_connections.fetch_add(1, Ordering::Relaxed);
            b.total_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn on_connection_closed(&self, backend: &str, success: bool, latency_ms: f64) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.latency.observe(latency_ms);
        if let Some(b) = self.backends.get(backend) {
            b.active_connections.fetch_sub(1, Ordering::Relaxed);
            b.latency.observe(latency_ms);
            if !success {
                b.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn add_bytes(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> flux_proto::MetricsData {
        let backend_metrics = self
            .backends
            .iter()
            .map(|entry| {
                let (avg, _p99) = entry.latency.snapshot();
                flux_proto::BackendMetrics {
                    address: entry.key().clone(),
                    active_connections: entry.active_connections.load(Ordering::Relaxed).max(0) as u64,
                    total_requests: entry.total_requests.load(Ordering::Relaxed),
                    failed_requests: entry.failed_requests.load(Ordering::Relaxed),
                    avg_latency_ms: avg,
                }
            })
            .collect();

        let (avg_latency_ms, p99_latency_ms) = self.latency.snapshot();

        flux_proto::MetricsData {
            active_connections: self.active_connections.load(Ordering::Relaxed).max(0) as u64,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            avg_latency_ms,
            p99_latency_ms,
            backend_metrics,
        }
    }
}

/// EWMA average plus a P² streaming quantile estimator for p99 — both
/// bounded-memory (no retained sample set), as the spec allows
/// ("p99 need not be exact").
struct LatencyEstimator {
    inner: Mutex<LatencyInner>,
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LatencyInner::default()),
        }
    }
}

#[derive(Default)]
struct LatencyInner {
    ewma_ms: f64,
    p2: P2Quantile,
}

impl LatencyEstimator {
    fn observe(&self, sample_ms: f64) {
        const ALPHA: f64 = 0.2;
        let mut inner = self.inner.lock().unwrap();
        if inner.ewma_ms == 0.0 {
            inner.ewma_ms = sample_ms;
        } else {
            inner.ewma_ms = ALPHA * sample_ms + (1.0 - ALPHA) * inner.ewma_ms;
        }
        inner.p2.observe(sample_ms);
    }

    fn snapshot(&self) -> (f64, f64) {
        let inner = self.inner.lock().unwrap();
        (inner.ewma_ms, inner.p2.quantile())
    }
}

/// Jain & Chlamtac's P² algorithm for a single quantile (p99), using
/// five markers and O(1) memory regardless of how many samples are
/// observed.
struct P2Quantile {
    p: f64,
    markers: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
    count: u64,
}

impl Default for P2Quantile {
    fn default() -> Self {
        Self::new(0.99)
    }
}

impl P2Quantile {
    fn new(p: f64) -> Self {
        Self {
            p,
            markers: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            count: 0,
        }
    }

    fn observe(&mut self, x: f64) {
        self.count += 1;
        let n = self.count;

        if n <= 5 {
            self.markers[(n - 1) as usize] = x;
            if n == 5 {
                self.markers.sort_by(|a, b| a.partial_cmp(b).unwrap());
            }
            return;
        }

        let mut k = 0usize;
        if x < self.markers[0] {
            self.markers[0] = x;
        } else if x >= self.markers[4] {
            self.markers[4] = x;
            k = 3;
        } else {
            for i in 0..4 {
                if self.markers[i] <= x && x < self.markers[i + 1] {
                    k = i;
                    break;
                }
            }
        }

        for i in (k + 1)..5 {
            self.positions[i] += 1.0;
        }
        for i in 0..5 {
            self.desired[i] += self.increments[i];
        }

        for i in 1..4 {
            let d = self.desired[i] - self.positions[i];
            let can_go_right = d >= 1.0 && self.positions[i + 1] - self.positions[i] > 1.0;
            let can_go_left = d <= -1.0 && self.positions[i - 1] - self.positions[i] < -1.0;
            if can_go_right || can_go_left {
                let dsign = if d >= 0.0 { 1.0 } else { -1.0 };
                let new_height = self.parabolic(i, dsign);
                if self.markers[i - 1] < new_height && new_height < self.markers[i + 1] {
                    self.markers[i] = new_height;
                } else {
                    self.markers[i] = self.linear(i, dsign);
                }
                self.positions[i] += dsign;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let qi = self.markers[i];
        let qip1 = self.markers[i + 1];
        let qim1 = self.markers[i - 1];
        let ni = self.positions[i];
        let nip1 = self.positions[i + 1];
        let nim1 = self.positions[i - 1];

        qi + d / (nip1 - nim1)
            * ((ni - nim1 + d) * (qip1 - qi) / (nip1 - ni)
                + (nip1 - ni - d) * (qi - qim1) / (ni - nim1))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let qi = self.markers[i];
        let idx = if d > 0.0 { i + 1 } else { i - 1 };
        qi + d * (self.markers[idx] - qi) / (self.positions[idx] - self.positions[i])
    }

    fn quantile(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else if self.count < 5 {
            let mut sorted = self.markers[..self.count as usize].to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = ((self.p * (sorted.len() - 1) as f64).round() as usize).min(sorted.len() - 1);
            sorted[idx]
        } else {
            self.markers[2]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_non_decreasing() {
        let registry = MetricsRegistry::new();
        registry.register_backend("b1");
        for _ in 0..10 {
            registry.on_connection_opened("b1");
        }
        let before = registry.snapshot().total_connections;
        for _ in 0..5 {
            registry.on_connection_opened("b1");
        }
        let after = registry.snapshot().total_connections;
        assert!(after >= before);
        assert_eq!(after, before + 5);
    }

    #[test]
    fn active_connections_gauge_is_bounded() {
        let registry = MetricsRegistry::new();
        registry.register_backend("b1");
        registry.on_connection_opened("b1");
        registry.on_connection_opened("b1");
        registry.on_connection_closed("b1", true, 1.0);
        let snap = registry.snapshot();
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn p99_estimate_is_in_a_sane_range_for_uniform_latencies() {
        let mut q = P2Quantile::new(0.99);
        for i in 1..=1000u64 {
            q.observe(i as f64);
        }
        let p99 = q.quantile();
        assert!(p99 > 900.0 && p99 <= 1000.0, "p99 was {p99}");
    }
}
