//! Prefix watcher producing instance-set snapshots

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{RegistryError, Result};
use crate::instance::Instance;
use crate::registry::decode_instances;
use crate::store::{CoordinationStore, StoreResult, WatchEvent, WatchStream};

/// Tracks the instances of one service.
///
/// Every successful [`next`](Watcher::next) yields the full current instance
/// set, never a delta. The first call returns immediately with the current
/// set; later calls wait for the store to report a change. Once stopped or
/// failed a watcher stays unusable; create a new one to resume.
pub struct Watcher {
    store: Arc<dyn CoordinationStore>,
    name: String,
    prefix: String,
    events: Option<WatchStream>,
    cancel: CancellationToken,
    first: bool,
}

enum Wake {
    Cancelled,
    Batch(Option<StoreResult<Vec<WatchEvent>>>),
}

impl Watcher {
    /// Open the watch session; store errors surface here.
    pub(crate) async fn start(
        store: Arc<dyn CoordinationStore>,
        name: &str,
        prefix: String,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let events = store.watch_prefix(&prefix).await?;
        debug!(service = name, prefix = %prefix, "Watch session started");
        Ok(Self {
            store,
            name: name.to_string(),
            prefix,
            events: Some(events),
            cancel,
            first: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next change and return the current instance set.
    pub async fn next(&mut self) -> Result<Vec<Instance>> {
        let Some(events) = self.events.as_mut() else {
            return Err(RegistryError::WatcherStopped);
        };
        if self.cancel.is_cancelled() {
            self.events = None;
            return Err(RegistryError::Cancelled);
        }

        if !std::mem::take(&mut self.first) {
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                batch = events.next() => Wake::Batch(batch),
            };
            match wake {
                Wake::Batch(Some(Ok(batch))) => {
                    trace!(service = %self.name, changes = batch.len(), "Watch batch received");
                }
                Wake::Batch(Some(Err(e))) => {
                    self.events = None;
                    return Err(e.into());
                }
                Wake::Batch(None) => {
                    debug!(service = %self.name, "Watch session closed by the store");
                    self.events = None;
                    return Err(RegistryError::WatchClosed);
                }
                Wake::Cancelled => {
                    self.events = None;
                    return Err(RegistryError::Cancelled);
                }
            }
        }

        let kvs = self.store.get_prefix(&self.prefix).await?;
        Ok(decode_instances(&self.name, &kvs))
    }

    /// End the watch session. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        if self.events.take().is_some() {
            debug!(service = %self.name, "Watch session stopped");
        }
        self.cancel.cancel();
        Ok(())
    }

    /// Token that ends this watcher when cancelled, usable from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Adapt into a stream of snapshots that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Instance>>> + Send {
        futures::stream::unfold(Some(self), |watcher| async move {
            let mut watcher = watcher?;
            match watcher.next().await {
                Ok(instances) => Some((Ok(instances), Some(watcher))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
