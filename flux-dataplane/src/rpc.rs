//! `DataPlaneControl` gRPC server: the control plane's only window into
//! a running data plane process.

use crate::config::ProxyConfig as InternalProxyConfig;
use crate::state::ProxyState;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

pub struct DataPlaneRpc {
    state: Arc<ProxyState>,
}

impl DataPlaneRpc {
    pub fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl flux_proto::DataPlaneControl for DataPlaneRpc {
    async fn update_config(
        &self,
        request: Request<flux_proto::ProxyConfig>,
    ) -> Result<Response<flux_proto::Ack>, Status> {
        let wire = request.into_inner();
        match InternalProxyConfig::try_from(wire) {
            Ok(config) => match self.state.apply_config(config) {
                Ok(()) => Ok(Response::new(flux_proto::Ack {
                    success: true,
                    message: "configuration applied".into(),
                })),
                Err(e) => Ok(Response::new(flux_proto::Ack {
                    success: false,
                    message: e.to_string(),
                })),
            },
            Err(e) => {
                warn!(error = %e, "rejected UpdateConfig: invalid configuration");
                Ok(Response::new(flux_proto::Ack {
                    success: false,
                    message: e.to_string(),
                }))
            }
        }
    }

    async fn reload_backends(
        &self,
        request: Request<flux_proto::BackendList>,
    ) -> Result<Response<flux_proto::ReloadAck>, Status> {
        let wire = request.into_inner();
        let mut current = (*self.state.current()).clone();

        let mut backends = Vec::with_capacity(wire.backends.len());
        for b in wire.backends {
            let health_check = b
                .health_check
                .map(|hc| flux_lb::HealthCheckDescriptor {
                    interval_seconds: hc.interval_seconds,
                    timeout_seconds: hc.timeout_seconds,
                    path: hc.path,
                })
                .unwrap_or_default();
            backends.push(crate::config::BackendSpec {
                address: b.address,
                weight: if b.weight > 0 { b.weight as u32 } else { 100 },
                healthy: b.healthy,
                health_check,
            });
        }

        let loaded = backends.len() as u32;
        current.backends = backends;

        match self.state.apply_config(current) {
            Ok(()) => Ok(Response::new(flux_proto::ReloadAck {
                success: true,
                message: "backends reloaded".into(),
                backends_loaded: loaded,
            })),
            Err(e) => Ok(Response::new(flux_proto::ReloadAck {
                success: false,
                message: e.to_string(),
                backends_loaded: 0,
            })),
        }
    }

    async fn drain_connections(
        &self,
        request: Request<flux_proto::DrainRequest>,
    ) -> Result<Response<flux_proto::DrainAck>, Status> {
        let timeout = Duration::from_secs(request.into_inner().timeout_seconds as u64);
        info!(timeout_seconds = timeout.as_secs(), "drain requested over RPC");

        let aborted_before = self
            .state
            .connections_aborted_by_drain
            .load(std::sync::atomic::Ordering::Acquire);

        self.state.begin_drain(timeout);
        // Handlers race their own relay against the same deadline and
        // self-abort; give them a short grace period past it to observe
        // the deadline and update the counter before we read it.
        let grace = tokio::time::Instant::now() + timeout + Duration::from_millis(250);
        while tokio::time::Instant::now() < grace
            && self.state.active_tcp_connections.load(std::sync::atomic::Ordering::Acquire) > 0
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let aborted_after = self
            .state
            .connections_aborted_by_drain
            .load(std::sync::atomic::Ordering::Acquire);

        Ok(Response::new(flux_proto::DrainAck {
            success: true,
            connections_drained: (aborted_after - aborted_before) as u32,
        }))
    }

    type StreamMetricsStream =
        Pin<Box<dyn Stream<Item = Result<flux_proto::MetricsData, Status>> + Send + 'static>>;

    async fn stream_metrics(
        &self,
        request: Request<Streaming<flux_proto::MetricsAck>>,
    ) -> Result<Response<Self::StreamMetricsStream>, Status> {
        let metrics = self.state.metrics.clone();
        let mut acks = request.into_inner();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot();
                        if tx.send(Ok(snapshot)).await.is_err() {
                            break;
                        }
                    }
                    ack = acks.next() => {
                        match ack {
                            Some(Ok(_)) => continue,
                            _ => break,
                        }
                    }
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }
}
