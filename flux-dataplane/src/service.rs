//! `DataPlaneService`: the top-level `FluxService` implementation.
//! Binds the TCP, UDP, and RPC listeners and runs the proxy engine
//! until a shutdown signal (or an RPC-driven `DrainConnections` call)
//! finishes draining.

use crate::config::ProxyConfig;
use crate::rpc::DataPlaneRpc;
use crate::state::ProxyState;
use crate::{tcp, udp};
use async_trait::async_trait;
use flux_core::{DependencyStatus, FluxError, FluxService, HealthStatus, ReadinessStatus, Result};
use flux_proto::DataPlaneControlServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::transport::Server;
use tracing::{error, info};

pub struct DataPlaneService {
    state: Arc<ProxyState>,
    rpc_addr: SocketAddr,
    start_time: Instant,
}

impl DataPlaneService {
    pub fn new(initial_config: ProxyConfig, rpc_addr: SocketAddr) -> Self {
        Self {
            state: ProxyState::new(initial_config),
            rpc_addr,
            start_time: Instant::now(),
        }
    }

    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }
}

#[async_trait]
impl FluxService for DataPlaneService {
    fn service_id(&self) -> &'static str {
        "flux-dataplane"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let backend_count = self.state.lb.backends().len();
        ReadinessStatus {
            ready: backend_count > 0 && !self.state.is_draining(),
            dependencies: vec![DependencyStatus {
                name: "backend-pool".into(),
                available: backend_count > 0,
                latency_ms: None,
            }],
        }
    }

    /// Invoked on process shutdown signal (SIGTERM/SIGINT); a fixed
    /// 30s drain deadline applies here, independent of any deadline an
    /// operator passes to the `DrainConnections` RPC while still live.
    async fn shutdown(&self) -> Result<()> {
        info!("data plane shutting down: beginning drain");
        let deadline = Duration::from_secs(30);
        self.state.begin_drain(deadline);

        // The runtime aborts the service task the moment this returns, so
        // block here until every in-flight connection has closed or the
        // deadline has passed rather than returning immediately.
        let grace = Instant::now() + deadline + Duration::from_millis(250);
        while Instant::now() < grace
            && self.state.active_tcp_connections.load(std::sync::atomic::Ordering::Acquire) > 0
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let tcp_task = tokio::spawn(tcp::run(self.state.clone()));
        let udp_task = tokio::spawn(udp::run(self.state.clone()));

        let rpc_service = DataPlaneRpc::new(self.state.clone());
        let drain_token = self.state.drain_token.clone();
        let rpc_addr = self.rpc_addr;
        info!(addr = %rpc_addr, "rpc control listener starting");
        let rpc_task = tokio::spawn(async move {
            Server::builder()
                .add_service(DataPlaneControlServer::new(rpc_service))
                .serve_with_shutdown(rpc_addr, drain_token.cancelled())
                .await
        });

        let (tcp_res, udp_res) = tokio::join!(tcp_task, udp_task);
        tcp_res.map_err(|e| FluxError::Config(e.to_string()))??;
        udp_res.map_err(|e| FluxError::Config(e.to_string()))??;

        match rpc_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "rpc server exited with error"),
            Err(e) => error!(error = %e, "rpc server task panicked"),
        }

        Ok(())
    }
}
