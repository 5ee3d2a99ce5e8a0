//! Global (and optionally per-client) token-bucket admission control.
//!
//! Gates new flows only — a new TCP accept, or a new UDP session — not
//! every packet inside an established UDP session.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            inner: Mutex::new(BucketInner {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Lazily refills based on elapsed time, then consumes `n` tokens
    /// iff available. Tokens stay within `[0, capacity]`.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.last_refill = now;
        inner.tokens = (inner.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        let n = n as f64;
        if inner.tokens >= n {
            inner.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Resizes capacity, clipping the current token count to fit —
    /// used when a reconfiguration changes `burst`.
    pub fn reconfigure(&self, capacity: u32, refill_per_sec: u32) -> TokenBucket {
        let inner = self.inner.lock().unwrap();
        let clipped = inner.tokens.min(capacity as f64);
        TokenBucket {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            inner: Mutex::new(BucketInner {
                tokens: clipped,
                last_refill: Instant::now(),
            }),
        }
    }
}

/// The global bucket admits every new flow. An optional per-client
/// bucket may additionally gate admission; disabled by default (see
/// the data model's open-question resolution in DESIGN.md).
pub struct RateLimiter {
    global: TokenBucket,
    per_client: Option<DashMap<IpAddr, TokenBucket>>,
    per_client_capacity: u32,
    per_client_refill: u32,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self {
            global: TokenBucket::new(burst, requests_per_second),
            per_client: None,
            per_client_capacity: burst,
            per_client_refill: requests_per_second,
        }
    }

    pub fn with_per_client(mut self) -> Self {
        self.per_client = Some(DashMap::new());
        self
    }

    /// Builds a replacement limiter for a new `requests_per_second`/
    /// `burst` pair, carrying the global bucket's current token count
    /// over (clipped to the new capacity) rather than resetting it —
    /// per the snapshot-apply contract in the spec's data model.
    pub fn reconfigure(&self, requests_per_second: u32, burst: u32) -> RateLimiter {
        RateLimiter {
            global: self.global.reconfigure(burst, requests_per_second),
            per_client: self.per_client.as_ref().map(|_| DashMap::new()),
            per_client_capacity: burst,
            per_client_refill: requests_per_second,
        }
    }

    pub fn admit_global(&self) -> bool {
        self.global.try_acquire(1)
    }

    pub fn admit(&self, client: IpAddr) -> bool {
        if !self.global.try_acquire(1) {
            return false;
        }
        match &self.per_client {
            None => true,
            Some(map) => {
                let bucket = map
                    .entry(client)
                    .or_insert_with(|| TokenBucket::new(self.per_client_capacity, self.per_client_refill));
                bucket.try_acquire(1)
            }
        }
    }
}
