//! Registration and discovery seams
//!
//! Lifecycle code registers through [`Registrar`]; routing code resolves
//! through [`Discovery`]. [`Registry`](crate::Registry) implements both.

use async_trait::async_trait;

use crate::error::Result;
use crate::instance::Instance;
use crate::watcher::Watcher;

/// Publishes and withdraws service instances.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, instance: &Instance) -> Result<()>;

    async fn deregister(&self, instance: &Instance) -> Result<()>;
}

/// Resolves and tracks the live instances of a service.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn get_service(&self, name: &str) -> Result<Vec<Instance>>;

    async fn watch(&self, name: &str) -> Result<Watcher>;
}
