//! UDP NAT session table: a bijective mapping from client address to a
//! backend-bound session, each owning a dedicated upstream socket and
//! reply-pump task — the fan-in-free design from the specification's
//! design notes (each session drains its own socket rather than one
//! demuxer serializing every backend's replies).

use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

pub struct Session {
    pub client_addr: SocketAddr,
    pub backend_addr: String,
    pub upstream_socket: Arc<UdpSocket>,
    last_activity_ms: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_to_client: AtomicU64,
    reply_pump: tokio::task::JoinHandle<()>,
}

impl Session {
    pub fn new(
        client_addr: SocketAddr,
        backend_addr: String,
        upstream_socket: Arc<UdpSocket>,
        reply_pump: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            client_addr,
            backend_addr,
            upstream_socket,
            last_activity_ms: AtomicU64::new(monotonic_ms()),
            bytes_to_backend: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            reply_pump,
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(monotonic_ms().saturating_sub(last))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reply_pump.abort();
    }
}

/// `client_addr -> Session`. Creation is linearized per client address
/// via a short-lived async mutex so two concurrent first packets from
/// the same client never race into two sessions.
pub struct NatTable {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    creation_locks: DashMap<SocketAddr, Arc<AsyncMutex<()>>>,
    ttl: Duration,
    draining: std::sync::atomic::AtomicBool,
}

impl NatTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
            ttl,
            draining: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn get(&self, client_addr: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get(client_addr).map(|s| s.clone())
    }

    /// Whether `drain` has been called. Callers must check this before
    /// admitting a brand-new client — an existing session may still be
    /// looked up and forwarded on; only creation of new sessions stops.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Returns the existing session for `client_addr`, or runs `create`
    /// to build one and inserts it. `create` is only invoked while
    /// holding this client's creation lock, and only if no session
    /// appeared while the lock was being acquired.
    ///
    /// Returns `None` — never calling `create` — if the table is
    /// draining and `client_addr` has no existing session: `drain`
    /// stops accepting new sessions, per the NAT table's contract. The
    /// draining check happens both before and after acquiring the
    /// per-client creation lock, so a session can never be admitted
    /// between a caller's own `is_draining` check and the point
    /// `drain()` clears the table.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        client_addr: SocketAddr,
        create: F,
    ) -> Option<Result<Arc<Session>, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>, E>>,
    {
        if let Some(existing) = self.sessions.get(&client_addr) {
            return Some(Ok(existing.clone()));
        }

        if self.draining.load(Ordering::Acquire) {
            return None;
        }

        let lock = self
            .creation_locks
            .entry(client_addr)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.sessions.get(&client_addr) {
            return Some(Ok(existing.clone()));
        }
        if self.draining.load(Ordering::Acquire) {
            return None;
        }

        let session = match create().await {
            Ok(session) => session,
            Err(e) => return Some(Err(e)),
        };
        self.sessions.insert(client_addr, session.clone());
        self.creation_locks.remove(&client_addr);
        Some(Ok(session))
    }

    pub fn touch(&self, client_addr: &SocketAddr) {
        if let Some(session) = self.sessions.get(client_addr) {
            session.touch();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes every session idle longer than the TTL. Returns the
    /// number evicted. Dropping the `Arc<Session>` aborts its reply
    /// pump and (once the last clone drops) the upstream socket.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|_, session| {
            let keep = session.idle_for() <= self.ttl;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Stops admitting new sessions and waits for existing ones to idle
    /// out, up to `deadline`; anything left is force-closed. Returns the
    /// number of sessions force-closed.
    pub async fn drain(&self, deadline: Duration) -> usize {
        self.draining.store(true, Ordering::Release);
        let start = Instant::now();
        while !self.sessions.is_empty() && start.elapsed() < deadline {
            self.sweep();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.sessions.len();
        self.sessions.clear();
        remaining
    }
}

fn monotonic_ms() -> u64 {
    // A fixed epoch relative to process start keeps this independent of
    // wall-clock adjustments, which would otherwise corrupt idle-time
    // math across a clock step.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().saturating_duration_since(start).as_millis() as u64
}
