//! Coordination store abstraction
//!
//! The registry needs an etcd-like store: leases with a TTL, keys bound to
//! leases, prefix reads and prefix watches. [`CoordinationStore`] captures
//! exactly that surface so the registry can run against etcd in production
//! and against [`InMemoryStore`] in tests or single-process deployments.

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;

pub use self::memory::{InMemoryStore, StoreStats};

#[cfg(feature = "etcd")]
pub use self::etcd::{EtcdOptions, EtcdStore};

/// Store-assigned lease identifier.
pub type LeaseId = i64;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One key/value pair returned from a prefix read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// A single change reported by a prefix watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key } => key,
        }
    }
}

/// Acknowledgment of one keep-alive round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease: LeaseId,
    /// Remaining time-to-live reported by the store, in seconds
    pub ttl: i64,
}

/// Stream of keep-alive acknowledgments; it ends when the lease is lost.
pub type KeepAliveStream = BoxStream<'static, KeepAliveAck>;

/// Stream of change batches under a prefix; dropping it cancels the watch.
pub type WatchStream = BoxStream<'static, StoreResult<Vec<WatchEvent>>>;

/// Lease-based key/value store used for registration and discovery.
///
/// Implementations share one connection handle across callers and must be
/// safe to use from many tasks at once.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Grant a lease that expires after `ttl_secs` unless kept alive.
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseId>;

    /// Write `key`, optionally bound to `lease`.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Read every key starting with `prefix`, in store order.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Start renewing `lease`.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream>;

    /// Subscribe to changes of every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;

    /// Revoke `lease` now, removing every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;
}
