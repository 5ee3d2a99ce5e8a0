//! UDP NAT proxy engine: one receive loop, session lookup/creation via
//! the NAT table, and a dedicated reply-pump task per session (the
//! fan-in-free design described in the specification's design notes).

use crate::nat::Session;
use crate::state::ProxyState;
use flux_core::{FluxError, Result};
use flux_lb::SelectionContext;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const MAX_SESSIONS: usize = 100_000;

pub async fn run(state: Arc<ProxyState>) -> Result<()> {
    let mut current_addr = state.current().listen.udp_address;
    let mut listener = Arc::new(bind(current_addr).await?);
    info!(addr = %current_addr, "udp listener bound");

    let sweeper = tokio::spawn(sweep_loop(state.clone()));

    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = state.drain_token.cancelled() => {
                info!("udp receive loop stopping: drain requested");
                sweeper.abort();
                let remaining = state.drain_deadline()
                    .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
                    .unwrap_or_default();
                let force_closed = state.nat.drain(remaining).await;
                if force_closed > 0 {
                    state.metrics.nat_sessions_evicted.fetch_add(force_closed as u64, Ordering::Relaxed);
                }
                return Ok(());
            }
            _ = state.listen_changed.notified() => {
                let new_addr = state.current().listen.udp_address;
                if new_addr != current_addr {
                    match bind(new_addr).await {
                        Ok(new_listener) => {
                            warn!(
                                old = %current_addr, new = %new_addr,
                                "udp listener rebound: brief window of unavailability"
                            );
                            listener = Arc::new(new_listener);
                            current_addr = new_addr;
                        }
                        Err(e) => warn!(error = %e, addr = %new_addr, "failed to rebind udp listener, keeping current"),
                    }
                }
            }
            received = listener.recv_from(&mut buf) => {
                match received {
                    Ok((len, src)) => {
                        let payload = buf[..len].to_vec();
                        let state = state.clone();
                        let listener = listener.clone();
                        tokio::spawn(async move {
                            handle_datagram(state, listener, src, payload).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "udp recv failed"),
                }
            }
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| FluxError::ListenBindFailure {
            addr: addr.to_string(),
            source,
        })
}

/// Admit (new sessions only) -> session lookup/create -> forward ->
/// touch, exactly as specified in the UDP proxy engine section.
async fn handle_datagram(
    state: Arc<ProxyState>,
    listener: Arc<UdpSocket>,
    src: SocketAddr,
    payload: Vec<u8>,
) {
    let has_session = state.nat.get(&src).is_some();
    if !has_session {
        if state.nat.is_draining() {
            debug!(%src, "dropping datagram from new client: nat table is draining");
            state.metrics.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !state.rate_limiter.load().admit(src.ip()) {
            state.metrics.rejected_rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if state.nat.len() >= MAX_SESSIONS {
            debug!(sessions = state.nat.len(), "nat table at capacity, dropping new session");
            state.metrics.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    let create_state = state.clone();
    let create_listener = listener.clone();
    let session = state
        .nat
        .get_or_create(src, move || create_session(create_state, create_listener, src))
        .await;

    let session = match session {
        Some(Ok(session)) => session,
        Some(Err(_)) => {
            state.metrics.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
            return;
        }
        None => {
            debug!(%src, "session creation refused: nat table is draining");
            state.metrics.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match session.upstream_socket.send(&payload).await {
        Ok(n) => {
            session.bytes_to_backend.fetch_add(n as u64, Ordering::Relaxed);
            state.metrics.add_bytes(n as u64, 0);
        }
        Err(e) => {
            debug!(backend = %session.backend_addr, error = %e, "udp send to backend failed");
            state.breaker.on_failure(&session.backend_addr);
        }
    }
    session.touch();
}

/// Selects a backend (retrying past breaker-denied candidates, same as
/// the TCP engine), opens a fresh ephemeral upstream socket connected
/// to it, and spawns the session's dedicated reply pump.
async fn create_session(
    state: Arc<ProxyState>,
    listener: Arc<UdpSocket>,
    client_addr: SocketAddr,
) -> Result<Arc<Session>> {
    let ctx = SelectionContext { client_ip: client_addr.ip() };
    let mut excluded = HashSet::new();
    let backend_count = state.lb.backends().len();

    let backend = loop {
        let candidate = state
            .lb
            .select_excluding(&ctx, &excluded)
            .map_err(|_| FluxError::NoBackendsAvailable)?;
        if state.breaker.allow(&candidate.address) {
            break candidate;
        }
        excluded.insert(candidate.address.clone());
        if excluded.len() >= backend_count {
            return Err(FluxError::AllBackendsUnavailable);
        }
    };

    let upstream = UdpSocket::bind("0.0.0.0:0").await?;
    upstream.connect(&backend.address).await?;
    let upstream = Arc::new(upstream);

    let pump = tokio::spawn(reply_pump(
        state.clone(),
        listener,
        upstream.clone(),
        client_addr,
        backend.address.clone(),
    ));

    Ok(Arc::new(Session::new(
        client_addr,
        backend.address.clone(),
        upstream,
        pump,
    )))
}

/// Reads replies off one session's upstream socket and steers them
/// back to the originating client. Terminates when the session is
/// evicted (the `Session`'s `Drop` aborts this task) or the socket
/// errors.
async fn reply_pump(
    state: Arc<ProxyState>,
    listener: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    client_addr: SocketAddr,
    backend_addr: String,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
    loop {
        match upstream.recv(&mut buf).await {
            Ok(n) => {
                if listener.send_to(&buf[..n], client_addr).await.is_err() {
                    break;
                }
                state.metrics.add_bytes(0, n as u64);
                state.nat.touch(&client_addr);
                state.breaker.on_success(&backend_addr);
            }
            Err(_) => break,
        }
    }
}

async fn sweep_loop(state: Arc<ProxyState>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let evicted = state.nat.sweep();
        state.metrics.nat_sweeps.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            state.metrics.nat_sessions_evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "nat sweep evicted idle sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackendSpec, CircuitBreakerConfig, ListenConfig, LoadBalancingConfig, ProxyConfig,
        RateLimitConfig, TimeoutConfig,
    };
    use flux_lb::Algorithm;

    fn test_config(backend_addr: String) -> ProxyConfig {
        ProxyConfig {
            listen: ListenConfig {
                tcp_address: "127.0.0.1:0".parse().unwrap(),
                udp_address: "127.0.0.1:0".parse().unwrap(),
            },
            backends: vec![BackendSpec {
                address: backend_addr,
                weight: 100,
                healthy: true,
                health_check: Default::default(),
            }],
            load_balancing: LoadBalancingConfig {
                algorithm: Algorithm::RoundRobin,
                session_affinity: false,
            },
            rate_limit: RateLimitConfig {
                requests_per_second: 1_000,
                burst: 1_000,
            },
            timeout: TimeoutConfig {
                connect: Duration::from_secs(1),
                idle: Duration::from_secs(5),
                read: Duration::from_secs(5),
            },
            circuit_breaker: CircuitBreakerConfig {
                error_threshold: 3,
                timeout: Duration::from_secs(2),
            },
        }
    }

    #[tokio::test]
    async fn datagrams_round_trip_through_a_session() {
        // A loopback "backend" that echoes whatever it receives.
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (n, peer) = match backend.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let _ = backend.send_to(&buf[..n], peer).await;
            }
        });

        let state = ProxyState::new(test_config(backend_addr.to_string()));
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listen_addr = listener.local_addr().unwrap();

        // A real client socket: the listener's `send_to` in the reply
        // pump addresses replies here, so this is the address the
        // handler sees as `src`. Connected to the listener so `recv`
        // (rather than `recv_from`) can be used below.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        for payload in [b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()] {
            handle_datagram(state.clone(), listener.clone(), client_addr, payload.clone()).await;
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
                .await
                .expect("reply should arrive before timeout")
                .unwrap();
            assert_eq!(&buf[..n], payload.as_slice());
        }
        assert_eq!(state.nat.len(), 1);
    }

    #[tokio::test]
    async fn session_creation_fails_gracefully_with_no_healthy_backends() {
        let mut config = test_config("127.0.0.1:9".into());
        config.backends[0].healthy = false;
        let state = ProxyState::new(config);
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client_addr: SocketAddr = "10.0.0.5:4000".parse().unwrap();

        let result = create_session(state, listener, client_addr).await;
        assert!(matches!(result, Err(FluxError::NoBackendsAvailable)));
    }
}
