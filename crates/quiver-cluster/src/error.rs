//! Cluster error types

use quiver_store::StoreError;
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Replication errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The backup asked for bytes the primary no longer retains
    #[error("unrecoverable gap: requested offset {requested}, primary retains from {min_available}")]
    UnrecoverableGap { requested: u64, min_available: u64 },

    /// The backup holds more than the primary
    #[error("backup ahead of primary: reported offset {reported}, primary max {primary_max}")]
    BackupAhead { reported: u64, primary_max: u64 },

    // ==================== Storage Errors ====================
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Internal Errors ====================
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Whether a backup should reconnect after this error
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::ConnectionFailed(_)
            | ClusterError::ConnectionClosed
            | ClusterError::Timeout
            | ClusterError::Protocol(_)
            | ClusterError::BackupAhead { .. }
            | ClusterError::Io(_) => true,
            ClusterError::Store(e) => !e.is_fatal() && !matches!(e, StoreError::ShuttingDown),
            _ => false,
        }
    }

    /// Check if this is a fatal error requiring shutdown
    pub fn is_fatal(&self) -> bool {
        match self {
            ClusterError::Store(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}

/// Queue allocation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
