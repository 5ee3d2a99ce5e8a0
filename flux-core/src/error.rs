//! Error taxonomy for the Flux data plane.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FluxError>;

/// None of these ever cross a task boundary as a panic — every fallible
/// operation on the hot path is handled at the task that owns the
/// affected socket or RPC call.
#[derive(Error, Debug)]
pub enum FluxError {
    // Admission errors
    #[error("rate limit rejected")]
    RateLimited,
    #[error("circuit breaker denied backend {0}")]
    BreakerDenied(String),
    #[error("no healthy backends available")]
    NoBackendsAvailable,
    #[error("all backends unavailable after retry")]
    AllBackendsUnavailable,

    // Upstream errors
    #[error("connect to {backend} timed out")]
    ConnectTimeout { backend: String },
    #[error("connect to {backend} refused: {source}")]
    ConnectRefused {
        backend: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream {0} reset the connection")]
    UpstreamReset(String),

    // Relay errors
    #[error("read timed out")]
    ReadTimeout,
    #[error("idle timeout exceeded")]
    IdleTimeout,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors (rejected RPCs keep the prior snapshot)
    #[error("unknown load balancing algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("backend list must not be empty")]
    EmptyBackends,
    #[error("configuration error: {0}")]
    Config(String),

    // Fatal errors
    #[error("failed to bind listener on {addr}: {source}")]
    ListenBindFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl FluxError {
    /// Stable machine-readable code, mirrored into RPC `Ack` messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::BreakerDenied(_) => "BREAKER_DENIED",
            Self::NoBackendsAvailable => "NO_BACKENDS_AVAILABLE",
            Self::AllBackendsUnavailable => "ALL_BACKENDS_UNAVAILABLE",
            Self::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            Self::ConnectRefused { .. } => "CONNECT_REFUSED",
            Self::UpstreamReset(_) => "UPSTREAM_RESET",
            Self::ReadTimeout => "READ_TIMEOUT",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::PeerClosed => "PEER_CLOSED",
            Self::Io(_) => "IO_ERROR",
            Self::UnknownAlgorithm(_) => "UNKNOWN_ALGORITHM",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::EmptyBackends => "EMPTY_BACKENDS",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ListenBindFailure { .. } => "LISTEN_BIND_FAILURE",
        }
    }

    /// Whether this error should count as a circuit-breaker failure for
    /// the backend it names.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::ConnectRefused { .. }
                | Self::UpstreamReset(_)
                | Self::ReadTimeout
                | Self::IdleTimeout
        )
    }

    /// Whether the process should exit non-zero because of this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ListenBindFailure { .. })
    }
}
