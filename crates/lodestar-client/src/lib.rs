//! Lodestar Client - self-healing service registration and discovery
//!
//! This crate provides:
//! - `Instance` model with order-independent equality and a fixed JSON wire format
//! - `Registry` for registering, deregistering, resolving and watching services
//! - Background lease supervision with bounded, randomized re-registration
//! - `CoordinationStore` abstraction with in-memory and etcd (feature `etcd`) backends
//! - Endpoint URI helpers for transports publishing their listeners

pub mod backoff;
pub mod endpoint;
pub mod error;
pub mod instance;
pub mod options;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod traits;
pub mod watcher;

pub use backoff::Backoff;
pub use error::{RegistryError, Result, StoreError};
pub use instance::Instance;
pub use options::RegistryOptions;
pub use registry::Registry;
pub use store::{CoordinationStore, InMemoryStore, LeaseId};
pub use supervisor::LeaseState;
pub use traits::{Discovery, Registrar};
pub use watcher::Watcher;

// Lifetime handle accepted by `Registry::with_lifetime`
pub use tokio_util::sync::CancellationToken;
