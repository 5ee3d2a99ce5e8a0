//! Process-level bootstrap configuration.
//!
//! This is distinct from `ProxyConfig` (the `flux-proto` wire schema):
//! `ProcessConfig` only covers what the process needs before it can
//! even talk to the control plane — where to listen for RPC, and at
//! what log level. The `--config <path>` flag is recognized for
//! symmetry with the wider control-plane ecosystem but is otherwise
//! unused; the authoritative `ProxyConfig` always arrives over RPC.

use clap::Parser;
use std::env;

use crate::error::Result;

#[derive(Debug, Parser)]
#[command(name = "flux-dataplane", version, about = "Flux layer-4 proxy data plane")]
pub struct Cli {
    /// Path to a config file, accepted for symmetry; configuration is
    /// authoritatively pushed over RPC.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub rpc_listen_addr: String,
    pub log_level: String,
}

impl ProcessConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            tcp_listen_addr: env::var("TCP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9000".to_string()),
            udp_listen_addr: env::var("UDP_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9001".to_string()),
            rpc_listen_addr: env::var("RPC_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Parses the recognized `--config` flag without reading it;
    /// returns the process-level config built from the environment.
    pub fn bootstrap() -> Result<Self> {
        let cli = Cli::parse();
        if let Some(path) = &cli.config {
            tracing::debug!(path, "ignoring --config: configuration arrives via RPC");
        }
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        // SAFETY: test-only, single-threaded access to process env vars
        // scoped to this test function.
        let keys = ["TCP_LISTEN_ADDR", "UDP_LISTEN_ADDR", "RPC_LISTEN_ADDR", "LOG_LEVEL"];
        for k in keys {
            std::env::remove_var(k);
        }
        let cfg = ProcessConfig::from_env().unwrap();
        assert_eq!(cfg.tcp_listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.udp_listen_addr, "0.0.0.0:9001");
        assert_eq!(cfg.rpc_listen_addr, "0.0.0.0:9090");
        assert_eq!(cfg.log_level, "info");
    }
}
