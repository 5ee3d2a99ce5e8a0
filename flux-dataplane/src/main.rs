//! `flux-dataplane` binary entrypoint: bootstraps process-level
//! configuration, initializes structured logging, and runs the data
//! plane service until a shutdown signal drains it.

use flux_core::{FluxError, ProcessConfig, Result, ServiceRuntime};
use flux_dataplane::config::{
    BackendSpec, CircuitBreakerConfig, ListenConfig, LoadBalancingConfig, ProxyConfig,
    RateLimitConfig, TimeoutConfig,
};
use flux_dataplane::DataPlaneService;
use flux_lb::Algorithm;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let process_config = ProcessConfig::bootstrap()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&process_config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("starting flux data plane");

    let tcp_address = process_config
        .tcp_listen_addr
        .parse()
        .map_err(|_| FluxError::InvalidAddress(process_config.tcp_listen_addr.clone()))?;
    let udp_address = process_config
        .udp_listen_addr
        .parse()
        .map_err(|_| FluxError::InvalidAddress(process_config.udp_listen_addr.clone()))?;
    let rpc_addr = process_config
        .rpc_listen_addr
        .parse()
        .map_err(|_| FluxError::InvalidAddress(process_config.rpc_listen_addr.clone()))?;

    // The data plane idles on this empty-backend bootstrap snapshot
    // until the control plane pushes a real configuration over the
    // `UpdateConfig` RPC; selection simply returns no-backends until then.
    let initial = ProxyConfig {
        listen: ListenConfig {
            tcp_address,
            udp_address,
        },
        backends: Vec::<BackendSpec>::new(),
        load_balancing: LoadBalancingConfig {
            algorithm: Algorithm::RoundRobin,
            session_affinity: false,
        },
        rate_limit: RateLimitConfig {
            requests_per_second: 1_000,
            burst: 2_000,
        },
        timeout: TimeoutConfig {
            connect: Duration::from_secs(5),
            idle: Duration::from_secs(60),
            read: Duration::from_secs(30),
        },
        circuit_breaker: CircuitBreakerConfig {
            error_threshold: 5,
            timeout: Duration::from_secs(30),
        },
    };

    let service = Arc::new(DataPlaneService::new(initial, rpc_addr));
    ServiceRuntime::run(service).await
}
