//! Error types for corral

use thiserror::Error;

/// Core error type for corral operations
#[derive(Error, Debug)]
pub enum CorralError {
    /// The pool was at capacity and no connection became free within the
    /// caller's wait timeout. Recoverable by retrying.
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Connection create failed: {0}")]
    ConnectionCreateFailed(String),

    /// Fatal to the acquire call: the connection is destroyed, never pooled.
    #[error("Transaction enlistment failed: {0}")]
    EnlistmentFailed(String),

    /// Advisory only. The pool records teardown failures and corrects its
    /// bookkeeping regardless; this variant never reaches a caller that did
    /// not initiate the destroy.
    #[error("Connection teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Illegal handle state: {0}")]
    IllegalHandleState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for corral operations
pub type Result<T> = std::result::Result<T, CorralError>;
