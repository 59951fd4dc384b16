// src/error.rs
use thiserror::Error;

/// Error kinds the core recognizes. Per-packet and per-connection instances
/// are never process-fatal; only `ConfigError` surfaces before the worker
/// loops start.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("client gone")]
    ClientGone,

    #[error("backpressure: queue limit exceeded")]
    Backpressure,

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("upstream timeout: {reason}")]
    UpstreamTimeout { reason: &'static str },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether this error should close the connection, vs. being accounted
    /// and the stream continuing.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::ClientGone | GatewayError::UpstreamTimeout { .. } | GatewayError::ProtocolError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
