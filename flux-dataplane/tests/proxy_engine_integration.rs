//! End-to-end exercises against the real TCP/UDP engines: a loopback
//! backend on one side, a raw client socket on the other, the proxy
//! wired up exactly as `DataPlaneService::start` wires it.

use flux_dataplane::breaker::BreakerState;
use flux_dataplane::config::{
    BackendSpec, CircuitBreakerConfig, ListenConfig, LoadBalancingConfig, ProxyConfig,
    RateLimitConfig, TimeoutConfig,
};
use flux_dataplane::{tcp, udp, ProxyState};
use flux_lb::Algorithm;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

fn base_config(tcp_port: u16, udp_port: u16, backends: Vec<BackendSpec>) -> ProxyConfig {
    ProxyConfig {
        listen: ListenConfig {
            tcp_address: format!("127.0.0.1:{tcp_port}").parse().unwrap(),
            udp_address: format!("127.0.0.1:{udp_port}").parse().unwrap(),
        },
        backends,
        load_balancing: LoadBalancingConfig {
            algorithm: Algorithm::RoundRobin,
            session_affinity: false,
        },
        rate_limit: RateLimitConfig {
            requests_per_second: 10_000,
            burst: 10_000,
        },
        timeout: TimeoutConfig {
            connect: Duration::from_millis(500),
            idle: Duration::from_secs(5),
            read: Duration::from_secs(5),
        },
        circuit_breaker: CircuitBreakerConfig {
            error_threshold: 3,
            timeout: Duration::from_secs(5),
        },
    }
}

fn backend_spec(address: String) -> BackendSpec {
    BackendSpec {
        address,
        weight: 100,
        healthy: true,
        health_check: Default::default(),
    }
}

/// A TCP backend that prefixes every echoed reply with `tag`, so a
/// client talking through the proxy can tell which backend answered.
async fn spawn_tagged_tcp_echo(tag: u8) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let mut reply = vec![tag];
                            reply.extend_from_slice(&buf[..n]);
                            if sock.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A TCP backend that accepts and then never writes anything back —
/// used to hold a connection open across a drain.
async fn spawn_silent_tcp_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => continue,
                    }
                }
            });
        }
    });
    addr
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// An address nothing listens on: bind, read back the ephemeral port,
/// then drop the listener so a later connect reliably sees
/// connection-refused rather than racing a still-open accept queue.
async fn closed_tcp_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn tcp_round_robin_distributes_across_both_backends() {
    let a = spawn_tagged_tcp_echo(b'a').await;
    let b = spawn_tagged_tcp_echo(b'b').await;

    let config = base_config(
        28101,
        28201,
        vec![backend_spec(a.to_string()), backend_spec(b.to_string())],
    );
    let state = ProxyState::new(config);
    tokio::spawn(tcp::run(state.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut tags = Vec::new();
    for _ in 0..6 {
        let mut client = TcpStream::connect("127.0.0.1:28101").await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[1..n], b"ping");
        tags.push(buf[0]);
    }

    let a_count = tags.iter().filter(|&&t| t == b'a').count();
    let b_count = tags.iter().filter(|&&t| t == b'b').count();
    assert_eq!(a_count, 3);
    assert_eq!(b_count, 3);
}

#[tokio::test]
async fn circuit_breaker_opens_after_repeated_connect_failures() {
    let dead = closed_tcp_address().await;
    let mut config = base_config(28102, 28202, vec![backend_spec(dead.to_string())]);
    config.circuit_breaker.error_threshold = 1;
    let state = ProxyState::new(config);
    tokio::spawn(tcp::run(state.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect("127.0.0.1:28102").await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "proxy closes the connection when the only backend is unreachable");

    assert_eq!(state.breaker.state(&dead.to_string()), BreakerState::Open);
}

#[tokio::test]
async fn udp_datagrams_round_trip_and_nat_table_tracks_distinct_clients() {
    let backend = spawn_udp_echo().await;
    let config = base_config(28103, 28203, vec![backend_spec(backend.to_string())]);
    let state = ProxyState::new(config);
    tokio::spawn(udp::run(state.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let proxy_addr: SocketAddr = "127.0.0.1:28203".parse().unwrap();

    let client_one = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_one.connect(proxy_addr).await.unwrap();
    let client_two = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_two.connect(proxy_addr).await.unwrap();

    for client in [&client_one, &client_two] {
        client.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
            .await
            .expect("reply should arrive")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    assert_eq!(state.nat.len(), 2);
}

#[tokio::test]
async fn rate_limiter_admits_only_the_configured_burst() {
    let backend = spawn_tagged_tcp_echo(b'x').await;
    let mut config = base_config(28104, 28204, vec![backend_spec(backend.to_string())]);
    config.rate_limit = RateLimitConfig {
        requests_per_second: 1,
        burst: 1,
    };
    let state = ProxyState::new(config);
    tokio::spawn(tcp::run(state.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First connection consumes the only token and should echo normally.
    let mut first = TcpStream::connect("127.0.0.1:28104").await.unwrap();
    first.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 16];
    let n = first.read(&mut buf).await.unwrap();
    assert_eq!(&buf[1..n], b"hi");

    // Immediately following connections find the bucket empty and are
    // closed without ever reaching a backend.
    let mut second = TcpStream::connect("127.0.0.1:28104").await.unwrap();
    let mut buf2 = [0u8; 16];
    let n2 = second.read(&mut buf2).await.unwrap();
    assert_eq!(n2, 0);

    assert!(state.metrics.rejected_rate_limited.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn draining_force_aborts_a_live_connection_at_the_deadline() {
    let backend = spawn_silent_tcp_backend().await;
    let config = base_config(28105, 28205, vec![backend_spec(backend.to_string())]);
    let state = ProxyState::new(config);
    tokio::spawn(tcp::run(state.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect("127.0.0.1:28105").await.unwrap();
    client.write_all(b"keepalive").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(state.active_tcp_connections.load(Ordering::Acquire), 1);

    state.begin_drain(Duration::from_millis(150));

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("the relay should be force-closed once the drain deadline passes");
    assert_eq!(read.unwrap(), 0);

    assert_eq!(state.connections_aborted_by_drain.load(Ordering::Acquire), 1);
    assert_eq!(state.active_tcp_connections.load(Ordering::Acquire), 0);
}

#[tokio::test]
async fn consistent_hash_routes_the_same_client_to_the_same_backend() {
    let a = spawn_tagged_tcp_echo(b'a').await;
    let b = spawn_tagged_tcp_echo(b'b').await;
    let c = spawn_tagged_tcp_echo(b'c').await;

    let mut config = base_config(
        28106,
        28206,
        vec![
            backend_spec(a.to_string()),
            backend_spec(b.to_string()),
            backend_spec(c.to_string()),
        ],
    );
    config.load_balancing.algorithm = Algorithm::ConsistentHash;
    let state = ProxyState::new(config);
    tokio::spawn(tcp::run(state.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // All connections originate from 127.0.0.1, so every one of them
    // should land on whichever single backend that client IP hashes to.
    let mut tags = Vec::new();
    for _ in 0..8 {
        let mut client = TcpStream::connect("127.0.0.1:28106").await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        tags.push(buf[0]);
        assert_eq!(&buf[1..n], b"hi");
    }

    let first = tags[0];
    assert!(tags.iter().all(|&t| t == first));
}
