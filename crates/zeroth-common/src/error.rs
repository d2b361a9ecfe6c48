//! Error types for Zeroth
//!
//! This module defines:
//! - `ZerothError`: Application-specific error enum
//! - `RpcError`: Failures of a single remote call, split into transport-class
//!   failures (expected under partial connectivity) and everything else

use std::time::Duration;

/// Result alias used throughout the workspace
pub type Result<T, E = ZerothError> = std::result::Result<T, E>;

/// Failure of one remote call
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("peer {0} unreachable: {1}")]
    Unreachable(String, String),

    #[error("call to {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("remote error from {0}: {1}")]
    Remote(String, String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl RpcError {
    /// Transport-class errors are logged and retried by callers; codec errors
    /// point at a protocol mismatch and are not.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Codec(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum ZerothError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    NotClusterMember(String),

    #[error("operation aborted")]
    Aborted,

    #[error("gate closed")]
    GateClosed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("group {0} is not served by this node")]
    UnknownGroup(String),
}

impl ZerothError {
    /// True for failures of a remote call that the caller may retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, ZerothError::Rpc(e) if e.is_transport())
    }
}
