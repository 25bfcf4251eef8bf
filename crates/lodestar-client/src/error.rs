//! Error types for the Lodestar client

use crate::store::LeaseId;

/// Error raised by a coordination store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

/// Error type for registry, lease supervision and watch operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("watcher stopped")]
    WatcherStopped,

    #[error("watch session closed")]
    WatchClosed,

    #[error("operation cancelled")]
    Cancelled,
}

impl RegistryError {
    /// Whether the error ends a watch session for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistryError::WatcherStopped | RegistryError::WatchClosed | RegistryError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
