//! Per-backend circuit breaker.
//!
//! Keyed by address in a `DashMap`, the same lock-free concurrent-map
//! technique `brivas-core::xdp::XdpController` uses to key its backend
//! pools. The `Closed -> Open(until) -> HalfOpen -> Closed|Open`
//! transition table is exactly the one in the specification.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerEntry {
    consecutive_failures: AtomicU32,
    /// 0 means "not open"; otherwise unix millis of when Open expires.
    open_until_ms: AtomicU64,
    half_open: AtomicBool,
    /// Guards at-most-one concurrent probe while HalfOpen.
    probe_in_flight: AtomicBool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            half_open: AtomicBool::new(false),
            probe_in_flight: AtomicBool::new(false),
        }
    }
}

pub struct CircuitBreaker {
    error_threshold: AtomicU32,
    open_timeout_ms: AtomicU64,
    entries: DashMap<String, BreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(error_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            error_threshold: AtomicU32::new(error_threshold.max(1)),
            open_timeout_ms: AtomicU64::new(open_timeout.as_millis() as u64),
            entries: DashMap::new(),
        }
    }

    /// Reconfiguration is shared across all tasks holding this breaker
    /// behind an `Arc`, so thresholds live in atomics rather than behind
    /// `&mut self`.
    pub fn reconfigure(&self, error_threshold: u32, open_timeout: Duration) {
        self.error_threshold
            .store(error_threshold.max(1), Ordering::Release);
        self.open_timeout_ms
            .store(open_timeout.as_millis() as u64, Ordering::Release);
    }

    /// Returns true iff the backend may be tried. In `Open` state,
    /// returns false until the timeout elapses; the first caller to
    /// observe the elapsed timeout flips the entry to `HalfOpen` and
    /// proceeds as the single allowed probe. Additional concurrent
    /// callers during `HalfOpen` see `false` and should try another
    /// backend.
    pub fn allow(&self, backend: &str) -> bool {
        let entry = self.entries.entry(backend.to_string()).or_default();

        let until = entry.open_until_ms.load(Ordering::Acquire);
        if until == 0 {
            // Closed, or already transitioned to HalfOpen.
            if entry.half_open.load(Ordering::Acquire) {
                return !entry.probe_in_flight.swap(true, Ordering::AcqRel);
            }
            return true;
        }

        if now_ms() < until {
            return false;
        }

        // Timeout elapsed: exactly one caller wins the Open->HalfOpen
        // transition via compare-exchange on open_until_ms.
        if entry
            .open_until_ms
            .compare_exchange(until, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            entry.half_open.store(true, Ordering::Release);
            entry.probe_in_flight.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn on_success(&self, backend: &str) {
        let entry = self.entries.entry(backend.to_string()).or_default();
        entry.consecutive_failures.store(0, Ordering::Release);
        if entry.half_open.swap(false, Ordering::AcqRel) {
            entry.probe_in_flight.store(false, Ordering::Release);
        }
        entry.open_until_ms.store(0, Ordering::Release);
    }

    pub fn on_failure(&self, backend: &str) {
        let entry = self.entries.entry(backend.to_string()).or_default();
        let was_half_open = entry.half_open.swap(false, Ordering::AcqRel);
        entry.probe_in_flight.store(false, Ordering::Release);

        if was_half_open {
            self.open(&entry);
            return;
        }

        let failures = entry.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.error_threshold.load(Ordering::Acquire) {
            self.open(&entry);
        }
    }

    fn open(&self, entry: &BreakerEntry) {
        let until = now_ms() + self.open_timeout_ms.load(Ordering::Acquire);
        entry.open_until_ms.store(until, Ordering::Release);
    }

    pub fn state(&self, backend: &str) -> BreakerState {
        match self.entries.get(backend) {
            None => BreakerState::Closed,
            Some(entry) => {
                if entry.half_open.load(Ordering::Acquire) {
                    BreakerState::HalfOpen
                } else if entry.open_until_ms.load(Ordering::Acquire) > now_ms() {
                    BreakerState::Open
                } else {
                    BreakerState::Closed
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
