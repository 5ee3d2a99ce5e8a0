//! Internal configuration snapshot, converted (with validation) from
//! the `flux-proto` wire schema pushed by the control plane.

use flux_core::{FluxError, Result};
use flux_lb::{Algorithm, HealthCheckDescriptor};
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub tcp_address: SocketAddr,
    pub udp_address: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub health_check: HealthCheckDescriptor,
}

#[derive(Debug, Clone)]
pub struct LoadBalancingConfig {
    pub algorithm: Algorithm,
    pub session_affinity: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connect: std::time::Duration,
    pub idle: std::time::Duration,
    pub read: std::time::Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub error_threshold: u32,
    pub timeout: std::time::Duration,
}

/// The immutable unit of configuration. Published atomically; flows
/// in progress keep the snapshot they started with.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub backends: Vec<BackendSpec>,
    pub load_balancing: LoadBalancingConfig,
    pub rate_limit: RateLimitConfig,
    pub timeout: TimeoutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl TryFrom<flux_proto::ProxyConfig> for ProxyConfig {
    type Error = FluxError;

    fn try_from(wire: flux_proto::ProxyConfig) -> Result<Self> {
        let listen = wire
            .listen
            .ok_or_else(|| FluxError::Config("missing listen config".into()))?;
        let tcp_address = listen
            .tcp_address
            .parse()
            .map_err(|_| FluxError::InvalidAddress(listen.tcp_address.clone()))?;
        let udp_address = listen
            .udp_address
            .parse()
            .map_err(|_| FluxError::InvalidAddress(listen.udp_address.clone()))?;

        if wire.backends.is_empty() {
            return Err(FluxError::EmptyBackends);
        }

        let mut seen = std::collections::HashSet::new();
        let mut backends = Vec::with_capacity(wire.backends.len());
        for b in wire.backends {
            // Validate the address parses, even though we keep it as a
            // string (DNS names are allowed at this layer; only the
            // syntax is checked here).
            if b.address.parse::<SocketAddr>().is_err() && !looks_like_host_port(&b.address) {
                return Err(FluxError::InvalidAddress(b.address));
            }
            if !seen.insert(b.address.clone()) {
                return Err(FluxError::Config(format!(
                    "duplicate backend address: {}",
                    b.address
                )));
            }
            let health_check = b
                .health_check
                .map(|hc| HealthCheckDescriptor {
                    interval_seconds: hc.interval_seconds,
                    timeout_seconds: hc.timeout_seconds,
                    path: hc.path,
                })
                .unwrap_or_default();
            backends.push(BackendSpec {
                address: b.address,
                weight: if b.weight > 0 { b.weight as u32 } else { 100 },
                healthy: b.healthy,
                health_check,
            });
        }

        let lb = wire
            .load_balancing
            .ok_or_else(|| FluxError::Config("missing load_balancing config".into()))?;
        let algorithm = Algorithm::from_str(&lb.algorithm)
            .map_err(|_| FluxError::UnknownAlgorithm(lb.algorithm.clone()))?;

        let traffic = wire
            .traffic
            .ok_or_else(|| FluxError::Config("missing traffic config".into()))?;
        let rl = traffic
            .rate_limit
            .ok_or_else(|| FluxError::Config("missing rate_limit config".into()))?;
        let to = traffic
            .timeout
            .ok_or_else(|| FluxError::Config("missing timeout config".into()))?;
        let cb = wire
            .circuit_breaker
            .ok_or_else(|| FluxError::Config("missing circuit_breaker config".into()))?;

        Ok(ProxyConfig {
            listen: ListenConfig {
                tcp_address,
                udp_address,
            },
            backends,
            load_balancing: LoadBalancingConfig {
                algorithm,
                session_affinity: lb.session_affinity,
            },
            rate_limit: RateLimitConfig {
                requests_per_second: rl.requests_per_second.max(0) as u32,
                burst: rl.burst.max(0) as u32,
            },
            timeout: TimeoutConfig {
                connect: std::time::Duration::from_secs(to.connect_seconds as u64),
                idle: std::time::Duration::from_secs(to.idle_seconds as u64),
                read: std::time::Duration::from_secs(to.read_seconds as u64),
            },
            circuit_breaker: CircuitBreakerConfig {
                error_threshold: cb.error_threshold.max(0) as u32,
                timeout: std::time::Duration::from_secs(cb.timeout_seconds.max(0) as u64),
            },
        })
    }
}

/// Accepts `host:port` addresses where `host` is a DNS name rather
/// than an IP literal (`SocketAddr::parse` only accepts IP literals).
fn looks_like_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
