//! Flux RPC wire schema.
//!
//! Generated from `proto/dataplane.proto` by `build.rs`. Field names
//! here are normative and mirror the control-plane/data-plane contract:
//! `UpdateConfig`, `ReloadBackends`, `DrainConnections`, and the
//! bidirectional-streaming `StreamMetrics`.

tonic::include_proto!("flux.dataplane.v1");

pub use data_plane_control_client::DataPlaneControlClient;
pub use data_plane_control_server::{DataPlaneControl, DataPlaneControlServer};
