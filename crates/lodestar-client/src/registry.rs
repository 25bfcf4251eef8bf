//! Service registry over a coordination store
//!
//! [`Registry`] publishes one instance under a lease and keeps it published
//! through a background [`LeaseSupervisor`](crate::supervisor), and resolves or
//! watches the instances other participants publish.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::instance::Instance;
use crate::options::RegistryOptions;
use crate::store::{CoordinationStore, KeyValue, LeaseId};
use crate::supervisor::{LeaseState, LeaseSupervisor, grant_and_put};
use crate::traits::{Discovery, Registrar};
use crate::watcher::Watcher;

/// Registration and discovery client bound to one coordination store.
///
/// A registry holds at most one active registration: registering again
/// retires the previous lease before a new one is granted.
pub struct Registry {
    store: Arc<dyn CoordinationStore>,
    options: RegistryOptions,
    /// Governs every background task spawned by this registry
    lifetime: CancellationToken,
    state: Arc<watch::Sender<LeaseState>>,
    registration: Mutex<Option<Registration>>,
}

/// The supervised task behind an active registration.
struct Registration {
    key: String,
    cancel: CancellationToken,
    handle: JoinHandle<Option<LeaseId>>,
}

impl Registration {
    /// Stop supervision and take back the lease it still holds.
    async fn stop(self) -> Option<LeaseId> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Lease supervisor task failed");
                None
            }
        }
    }
}

impl Registry {
    /// Create a registry whose background work lives until [`shutdown`](Self::shutdown)
    /// or until the registry is dropped.
    pub fn new(store: Arc<dyn CoordinationStore>, options: RegistryOptions) -> Result<Self> {
        Self::with_lifetime(store, options, CancellationToken::new())
    }

    /// Create a registry whose background work also ends when `lifetime` is cancelled.
    pub fn with_lifetime(
        store: Arc<dyn CoordinationStore>,
        options: RegistryOptions,
        lifetime: CancellationToken,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            options,
            lifetime: lifetime.child_token(),
            state: Arc::new(watch::Sender::new(LeaseState::Unleased)),
            registration: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Current state of the registration lease.
    pub fn lease_state(&self) -> LeaseState {
        *self.state.borrow()
    }

    /// Follow lease state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Publish `instance` under a fresh lease and keep it alive in the background.
    ///
    /// The first grant and put are not retried; a failure is returned to the
    /// caller. Supervision outlives this call and ends on
    /// [`deregister`](Self::deregister), [`shutdown`](Self::shutdown) or drop.
    pub async fn register(&self, instance: &Instance) -> Result<()> {
        instance.validate()?;
        if self.lifetime.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let key = self.options.instance_key(&instance.name, &instance.id);
        let value = instance.to_bytes()?;

        let mut registration = self.registration.lock().await;
        if let Some(previous) = registration.take() {
            debug!(key = %previous.key, "Retiring previous registration");
            if let Some(lease) = previous.stop().await {
                self.release(lease).await;
            }
        }

        self.state.send_replace(LeaseState::Unleased);
        let lease = grant_and_put(
            self.store.as_ref(),
            &key,
            &value,
            self.options.ttl_secs(),
        )
        .await?;
        self.state.send_replace(LeaseState::Leased);

        let cancel = self.lifetime.child_token();
        let supervisor = LeaseSupervisor::new(
            self.store.clone(),
            key.clone(),
            value,
            &self.options,
            cancel.clone(),
            self.state.clone(),
        );
        let handle = tokio::spawn(supervisor.run(lease));

        info!(key = %key, lease, instance = %instance, "Registered instance");
        *registration = Some(Registration {
            key,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Withdraw `instance`: stop supervision, delete its key, release the lease.
    ///
    /// The lease is released even when the delete fails. Deregistering an
    /// instance that is not registered is not an error.
    pub async fn deregister(&self, instance: &Instance) -> Result<()> {
        let key = self.options.instance_key(&instance.name, &instance.id);

        let registration = self.registration.lock().await.take();
        let lease = match registration {
            Some(registration) => registration.stop().await,
            None => None,
        };

        let deleted = self.store.delete(&key).await;
        if let Some(lease) = lease {
            self.release(lease).await;
        }
        deleted?;

        info!(key = %key, instance = %instance, "Deregistered instance");
        Ok(())
    }

    /// Resolve the instances currently published for `name`.
    ///
    /// Records that fail to decode, or that decode to another service, are
    /// skipped. Order follows the store.
    pub async fn get_service(&self, name: &str) -> Result<Vec<Instance>> {
        let kvs = self
            .store
            .get_prefix(&self.options.service_prefix(name))
            .await?;
        Ok(decode_instances(name, &kvs))
    }

    /// Open a watcher over the instances of `name`.
    pub async fn watch(&self, name: &str) -> Result<Watcher> {
        // trailing slash keeps `orders-v2` writes from waking an `orders` watcher
        Watcher::start(
            self.store.clone(),
            name,
            format!("{}/", self.options.service_prefix(name)),
            self.lifetime.child_token(),
        )
        .await
    }

    /// End all background work and release the held lease.
    pub async fn shutdown(&self) {
        self.lifetime.cancel();
        let registration = self.registration.lock().await.take();
        if let Some(registration) = registration
            && let Some(lease) = registration.stop().await
        {
            self.release(lease).await;
        }
        self.state.send_replace(LeaseState::Closed);
        debug!("Registry shut down");
    }

    /// Best-effort revoke; the lease expires on its own if this fails.
    async fn release(&self, lease: LeaseId) {
        if let Err(e) = self.store.revoke(lease).await {
            debug!(lease, error = %e, "Failed to revoke lease");
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[async_trait]
impl Registrar for Registry {
    async fn register(&self, instance: &Instance) -> Result<()> {
        Registry::register(self, instance).await
    }

    async fn deregister(&self, instance: &Instance) -> Result<()> {
        Registry::deregister(self, instance).await
    }
}

#[async_trait]
impl Discovery for Registry {
    async fn get_service(&self, name: &str) -> Result<Vec<Instance>> {
        Registry::get_service(self, name).await
    }

    async fn watch(&self, name: &str) -> Result<Watcher> {
        Registry::watch(self, name).await
    }
}

/// Decode the records of a prefix read, keeping only instances of `name`.
pub(crate) fn decode_instances(name: &str, kvs: &[KeyValue]) -> Vec<Instance> {
    kvs.iter()
        .filter_map(|kv| match Instance::from_bytes(&kv.value) {
            Ok(instance) if instance.name == name => Some(instance),
            Ok(instance) => {
                debug!(
                    key = %kv.key,
                    service = name,
                    found = %instance.name,
                    "Skipping record of another service"
                );
                None
            }
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable instance record");
                None
            }
        })
        .collect()
}
