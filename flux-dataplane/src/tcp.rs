//! TCP proxy engine: accept, admit, select a backend, connect upstream,
//! relay bytes in both directions, tear down.

use crate::state::ProxyState;
use flux_core::{FluxError, Result};
use flux_lb::SelectionContext;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const RELAY_BUFFER_SIZE: usize = 32 * 1024;
const CONNECT_RETRY_CAP: usize = 3;

pub async fn run(state: Arc<ProxyState>) -> Result<()> {
    let mut current_addr = state.current().listen.tcp_address;
    let mut listener = bind(current_addr).await?;
    info!(addr = %current_addr, "tcp acceptor listening");

    loop {
        tokio::select! {
            _ = state.drain_token.cancelled() => {
                info!("tcp acceptor stopping: drain requested");
                return Ok(());
            }
            _ = state.listen_changed.notified() => {
                let new_addr = state.current().listen.tcp_address;
                if new_addr != current_addr {
                    match bind(new_addr).await {
                        Ok(new_listener) => {
                            info!(old = %current_addr, new = %new_addr, "tcp listener rebound");
                            listener = new_listener;
                            current_addr = new_addr;
                        }
                        Err(e) => warn!(error = %e, addr = %new_addr, "failed to rebind tcp listener, keeping current"),
                    }
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_connection(state, socket, peer).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "tcp accept failed"),
                }
            }
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| FluxError::ListenBindFailure {
            addr: addr.to_string(),
            source,
        })
}

async fn handle_connection(state: Arc<ProxyState>, mut client: TcpStream, peer: SocketAddr) {
    if !state.rate_limiter.load().admit(peer.ip()) {
        state.metrics.rejected_rate_limited.fetch_add(1, Ordering::Relaxed);
        let _ = client.shutdown().await;
        return;
    }

    let config = state.current();
    let ctx = SelectionContext { client_ip: peer.ip() };
    let mut excluded = HashSet::new();
    let backend_count = state.lb.backends().len();

    let start = Instant::now();
    let mut outcome: Option<(Arc<flux_lb::Backend>, TcpStream)> = None;

    // Outer loop: bounds connect-failure retries at a small constant.
    // Inner loop: re-consults the load balancer past breaker-denied
    // backends, bounded by the full backend list so a run of denied
    // candidates never starves out the remaining healthy ones.
    'connect: for _ in 0..CONNECT_RETRY_CAP {
        let backend = loop {
            let candidate = match state.lb.select_excluding(&ctx, &excluded) {
                Ok(b) => b,
                Err(_) => {
                    state.metrics.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
                    break 'connect;
                }
            };
            if state.breaker.allow(&candidate.address) {
                break candidate;
            }
            excluded.insert(candidate.address.clone());
            if excluded.len() >= backend_count {
                state.metrics.rejected_no_backend.fetch_add(1, Ordering::Relaxed);
                break 'connect;
            }
        };

        match timeout(config.timeout.connect, TcpStream::connect(&backend.address)).await {
            Ok(Ok(upstream)) => {
                outcome = Some((backend, upstream));
                break 'connect;
            }
            Ok(Err(e)) => {
                debug!(backend = %backend.address, error = %e, "connect refused");
                state.breaker.on_failure(&backend.address);
                excluded.insert(backend.address.clone());
            }
            Err(_) => {
                debug!(backend = %backend.address, "connect timed out");
                state.breaker.on_failure(&backend.address);
                excluded.insert(backend.address.clone());
            }
        }
    }

    let Some((backend, upstream)) = outcome else {
        let _ = client.shutdown().await;
        return;
    };

    backend.inc_connections();
    state.metrics.on_connection_opened(&backend.address);
    state.active_tcp_connections.fetch_add(1, Ordering::AcqRel);

    let success = relay_with_drain(client, upstream, config.timeout.idle, config.timeout.read, &state).await;

    backend.dec_connections();
    state.active_tcp_connections.fetch_sub(1, Ordering::AcqRel);

    if success {
        state.breaker.on_success(&backend.address);
    } else {
        state.breaker.on_failure(&backend.address);
    }
    state
        .metrics
        .on_connection_closed(&backend.address, success, start.elapsed().as_millis() as f64);
}

/// Runs `relay` to completion unless a drain begins first; once the
/// global drain signal fires, races the still-running relay against
/// the drain deadline and force-closes both sockets (dropping the
/// pinned future) if the deadline passes first.
async fn relay_with_drain(
    client: TcpStream,
    upstream: TcpStream,
    idle_timeout: std::time::Duration,
    read_timeout: std::time::Duration,
    state: &Arc<ProxyState>,
) -> bool {
    let relaying = relay(client, upstream, idle_timeout, read_timeout, state);
    tokio::pin!(relaying);

    tokio::select! {
        success = &mut relaying => success,
        _ = state.drain_token.cancelled() => {
            match state.drain_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        success = &mut relaying => success,
                        _ = tokio::time::sleep_until(deadline) => {
                            state.connections_aborted_by_drain.fetch_add(1, Ordering::AcqRel);
                            false
                        }
                    }
                }
                None => relaying.await,
            }
        }
    }
}

/// Two concurrent half-duplex pumps. Either side hitting EOF, an error,
/// or the idle/read timeout tears down both sockets. Returns whether
/// both directions ended in a clean EOF (the circuit breaker counts
/// anything else — a reset or a timeout with the connection still
/// open — as a failure).
async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    idle_timeout: std::time::Duration,
    read_timeout: std::time::Duration,
    state: &Arc<ProxyState>,
) -> bool {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let per_read_timeout = idle_timeout.min(read_timeout);

    let state_a = state.clone();
    let to_upstream = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let clean = loop {
            let read = match timeout(per_read_timeout, tokio::io::AsyncReadExt::read(&mut client_read, &mut buf)).await {
                Ok(Ok(0)) => break true,
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => break false,
            };
            if tokio::io::AsyncWriteExt::write_all(&mut upstream_write, &buf[..read]).await.is_err() {
                break false;
            }
            state_a.metrics.add_bytes(read as u64, 0);
        };
        let _ = upstream_write.shutdown().await;
        clean
    };

    let state_b = state.clone();
    let to_client = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let clean = loop {
            let read = match timeout(per_read_timeout, tokio::io::AsyncReadExt::read(&mut upstream_read, &mut buf)).await {
                Ok(Ok(0)) => break true,
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => break false,
            };
            if tokio::io::AsyncWriteExt::write_all(&mut client_write, &buf[..read]).await.is_err() {
                break false;
            }
            state_b.metrics.add_bytes(0, read as u64);
        };
        let _ = client_write.shutdown().await;
        clean
    };

    let (upstream_clean, client_clean) = tokio::join!(to_upstream, to_client);
    upstream_clean && client_clean
}
