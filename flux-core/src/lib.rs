//! Flux core - shared runtime scaffolding for the data plane binary.
//!
//! This crate provides:
//! - The error taxonomy shared across the proxy engine
//! - The service lifecycle trait every long-running Flux process implements
//! - Process-level (env + CLI) bootstrap configuration

pub mod config;
pub mod error;
pub mod service;

pub use config::ProcessConfig;
pub use error::{FluxError, Result};
pub use service::{DependencyStatus, FluxService, HealthStatus, ReadinessStatus, ServiceRuntime};
