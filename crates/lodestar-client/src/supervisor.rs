//! Lease supervision
//!
//! A [`LeaseSupervisor`] owns the lease behind one registration. It keeps the
//! lease alive and, when the keep-alive stream dies, re-registers the same
//! key/value under a fresh lease with bounded, randomized backoff:
//!
//! ```text
//! Unleased -> Leased -> KeepAliveOk <-> Recovering -> Closed
//! ```
//!
//! All store writes of one registration happen on the supervisor task, one at
//! a time. Cancelling the supervisor's token stops it at any suspension point
//! without further writes; the lease it still holds is handed back to the
//! caller, which decides whether to revoke it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::StoreError;
use crate::options::RegistryOptions;
use crate::store::{CoordinationStore, KeepAliveStream, LeaseId, StoreResult};

/// Lifecycle of the lease behind a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeaseState {
    /// No lease held yet
    Unleased,
    /// Lease granted and record written, keep-alive not yet acknowledged
    Leased,
    /// Keep-alive acknowledgments are flowing
    KeepAliveOk,
    /// Lease lost; re-registration in progress
    Recovering,
    /// Supervision ended: cancelled, deregistered or retries exhausted
    Closed,
}

/// Grant a lease and bind `key` to it.
///
/// If the put fails the fresh lease is revoked on a best-effort basis; it
/// would otherwise linger until its TTL runs out.
pub(crate) async fn grant_and_put(
    store: &dyn CoordinationStore,
    key: &str,
    value: &[u8],
    ttl_secs: i64,
) -> StoreResult<LeaseId> {
    let lease = store.grant(ttl_secs).await?;
    if let Err(e) = store.put(key, value.to_vec(), Some(lease)).await {
        if let Err(revoke_err) = store.revoke(lease).await {
            debug!(lease, error = %revoke_err, "Failed to revoke orphaned lease");
        }
        return Err(e);
    }
    Ok(lease)
}

/// Why the keep-alive phase ended.
#[derive(Debug, PartialEq, Eq)]
enum KeepAliveExit {
    Cancelled,
    Lost,
}

/// Outcome of one recovery episode.
enum Recovery {
    Recovered(LeaseId, KeepAliveStream),
    Cancelled,
    TimedOut,
    Exhausted,
}

/// Background owner of one registration's lease.
pub(crate) struct LeaseSupervisor {
    store: Arc<dyn CoordinationStore>,
    key: String,
    value: Vec<u8>,
    ttl_secs: i64,
    max_retry: u32,
    attempt_timeout: Duration,
    cancel: CancellationToken,
    state: Arc<watch::Sender<LeaseState>>,
}

impl LeaseSupervisor {
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        key: String,
        value: Vec<u8>,
        options: &RegistryOptions,
        cancel: CancellationToken,
        state: Arc<watch::Sender<LeaseState>>,
    ) -> Self {
        Self {
            store,
            key,
            value,
            ttl_secs: options.ttl_secs(),
            max_retry: options.max_retry,
            attempt_timeout: options.attempt_timeout,
            cancel,
            state,
        }
    }

    /// Supervise `lease` until cancelled or until recovery gives up.
    ///
    /// Returns the lease still held when supervision was cancelled, `None`
    /// when no live lease is left.
    pub(crate) async fn run(self, lease: LeaseId) -> Option<LeaseId> {
        let mut lease = lease;
        let mut acks = self.open_keep_alive(lease).await;

        loop {
            if self.cancel.is_cancelled() {
                return self.close(Some(lease));
            }
            if let Some(stream) = acks.take()
                && self.keep_alive(lease, stream).await == KeepAliveExit::Cancelled
            {
                return self.close(Some(lease));
            }

            warn!(key = %self.key, lease, "Lease lost, re-registering");
            self.state.send_replace(LeaseState::Recovering);
            self.discard(lease).await;

            match self.recover().await {
                Recovery::Recovered(next, stream) => {
                    lease = next;
                    acks = Some(stream);
                }
                Recovery::Cancelled => {
                    debug!(key = %self.key, "Recovery cancelled");
                    return self.close(None);
                }
                Recovery::TimedOut => {
                    error!(
                        key = %self.key,
                        timeout = ?self.attempt_timeout,
                        "Re-registration attempt timed out, instance is no longer registered"
                    );
                    return self.close(None);
                }
                Recovery::Exhausted => {
                    error!(
                        key = %self.key,
                        attempts = self.max_retry,
                        "Re-registration retries exhausted, instance is no longer registered"
                    );
                    return self.close(None);
                }
            }
        }
    }

    async fn open_keep_alive(&self, lease: LeaseId) -> Option<KeepAliveStream> {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            opened = self.store.keep_alive(lease) => opened,
        };
        match opened {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(key = %self.key, lease, error = %e, "Failed to start lease keep-alive");
                None
            }
        }
    }

    /// Drain keep-alive acknowledgments until the stream dies or we are cancelled.
    async fn keep_alive(&self, lease: LeaseId, mut acks: KeepAliveStream) -> KeepAliveExit {
        loop {
            let ack = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return KeepAliveExit::Cancelled,
                ack = acks.next() => ack,
            };
            match ack {
                Some(ack) => {
                    trace!(key = %self.key, lease, ttl = ack.ttl, "Lease keep-alive acknowledged");
                    self.state.send_if_modified(|state| {
                        let changed = *state != LeaseState::KeepAliveOk;
                        *state = LeaseState::KeepAliveOk;
                        changed
                    });
                }
                None if self.cancel.is_cancelled() => return KeepAliveExit::Cancelled,
                None => return KeepAliveExit::Lost,
            }
        }
    }

    /// Run one recovery episode of at most `max_retry` attempts.
    async fn recover(&self) -> Recovery {
        let mut backoff = Backoff::new();

        for attempt in 0..self.max_retry {
            if self.cancel.is_cancelled() {
                return Recovery::Cancelled;
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Recovery::Cancelled,
                outcome = tokio::time::timeout(self.attempt_timeout, self.reregister()) => outcome,
            };
            let err = match outcome {
                Err(_elapsed) => return Recovery::TimedOut,
                Ok(Ok((lease, acks))) => {
                    info!(key = %self.key, lease, attempt, "Re-registered instance");
                    self.state.send_replace(LeaseState::Leased);
                    return Recovery::Recovered(lease, acks);
                }
                Ok(Err(e)) => e,
            };

            if attempt + 1 == self.max_retry {
                warn!(key = %self.key, attempt, error = %err, "Re-registration failed");
                break;
            }
            let delay = backoff.next_delay(attempt);
            warn!(
                key = %self.key,
                attempt,
                delay = ?delay,
                error = %err,
                "Re-registration failed, backing off"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Recovery::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Recovery::Exhausted
    }

    /// One re-registration attempt: fresh lease, record, keep-alive stream.
    async fn reregister(&self) -> StoreResult<(LeaseId, KeepAliveStream)> {
        let lease =
            grant_and_put(self.store.as_ref(), &self.key, &self.value, self.ttl_secs).await?;
        match self.store.keep_alive(lease).await {
            Ok(acks) => Ok((lease, acks)),
            Err(e) => {
                self.discard(lease).await;
                Err(e)
            }
        }
    }

    /// Best-effort revoke of a lease we no longer trust.
    async fn discard(&self, lease: LeaseId) {
        match self.store.revoke(lease).await {
            Ok(()) => debug!(key = %self.key, lease, "Revoked stale lease"),
            Err(StoreError::LeaseNotFound(_)) => {}
            Err(e) => debug!(key = %self.key, lease, error = %e, "Failed to revoke stale lease"),
        }
    }

    fn close(&self, lease: Option<LeaseId>) -> Option<LeaseId> {
        self.state.send_replace(LeaseState::Closed);
        debug!(key = %self.key, lease = ?lease, "Lease supervision ended");
        lease
    }
}
