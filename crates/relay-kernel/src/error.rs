//! Crate-level error types for `relay-kernel`.
//!
//! [`EngineError`] is the taxonomy every engine call surfaces to callers.
//! [`KernelError`] composes it with configuration, IO and serialization
//! failures and is carried inside an [`error_stack::Report`] on paths that
//! benefit from attached context (configuration loading, CLI setup).
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_kernel::error::{KernelError, KernelResult};
//! use error_stack::ResultExt;
//!
//! fn read_items(path: &str) -> KernelResult<String> {
//!     std::fs::read_to_string(path)
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach(format!("reading {path}"))
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::domain::DomainType;
use crate::wire::ProtocolError;

/// Failures surfaced by the worker coordination engine.
///
/// Engine-level variants (`Protocol`, `PoolExhausted`, `Timeout`,
/// `Connection`, `Spawn`, `Closed`) describe the transport. `Worker` is a
/// normal domain failure reported by the worker itself and is returned
/// unchanged.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A response line could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No connection became available within the acquire timeout.
    #[error("{domain} pool exhausted after waiting {waited:?}")]
    PoolExhausted { domain: DomainType, waited: Duration },

    /// No response arrived before the request deadline.
    #[error("request `{action}` timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    /// The worker process exited or its stream failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The worker answered with `success: false`.
    #[error("worker error in `{action}`: {message}")]
    Worker { action: String, message: String },

    /// A worker process could not be started or failed its handshake.
    #[error("failed to spawn {domain} worker: {reason}")]
    Spawn { domain: DomainType, reason: String },

    /// The pool or engine has been shut down.
    #[error("{0} pool is closed")]
    Closed(DomainType),

    /// The request itself is unusable (e.g. zero batch concurrency).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Whether a batch item failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EngineError::Closed(_) | EngineError::InvalidRequest(_))
    }

    /// Short stable label, suitable for metrics and API error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Protocol(_) => "protocol",
            EngineError::PoolExhausted { .. } => "pool_exhausted",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Connection(_) => "connection",
            EngineError::Worker { .. } => "worker",
            EngineError::Spawn { .. } => "spawn",
            EngineError::Closed(_) => "closed",
            EngineError::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Crate-level error type for `relay-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A coordination engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// A configuration-related error.
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
