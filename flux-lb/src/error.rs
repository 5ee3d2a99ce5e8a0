use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LbError {
    #[error("no healthy backends available")]
    NoBackendsAvailable,
    #[error("unknown load balancing algorithm: {0}")]
    UnknownAlgorithm(String),
}
