//! In-process coordination store
//!
//! Implements the full [`CoordinationStore`] contract in memory: leases expire
//! on the tokio clock, keep-alive streams renew them, and prefix watches see
//! every put and delete. Each lease has an expiry task that removes it at its
//! deadline, so watchers see the deletes even when nothing else touches the
//! store.
//!
//! Besides single-process deployments it doubles as a fault-injecting store
//! for tests: the connection can be dropped, leases expired on demand, and
//! grants made to fail or hang.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    CoordinationStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreResult,
    WatchEvent, WatchStream,
};
use crate::error::StoreError;

const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// Call counters, recorded on entry whether or not the call succeeds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub grants: u64,
    pub puts: u64,
    pub deletes: u64,
    pub revokes: u64,
    pub keep_alives: u64,
    pub watches: u64,
}

/// Coordination store held entirely in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// Cancelled whenever the simulated connection drops
    connection: Mutex<CancellationToken>,
    unavailable: AtomicBool,
    stall_grants: AtomicBool,
    failing_grants: AtomicU32,
    grants: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    revokes: AtomicU64,
    keep_alives: AtomicU64,
    watches: AtomicU64,
}

#[derive(Default)]
struct State {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    data: BTreeMap<String, Entry>,
    watchers: Vec<PrefixWatcher>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
    /// Cancelled when the lease is revoked or expires
    ended: CancellationToken,
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct PrefixWatcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreResult<Vec<WatchEvent>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (`false`) or regaining (`true`) the store connection.
    ///
    /// While unavailable every call fails; dropping the connection also ends
    /// all open keep-alive streams and watches.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            let previous = std::mem::take(&mut *self.inner.connection.lock());
            previous.cancel();
            self.inner.state.lock().watchers.clear();
            debug!("In-memory store connection dropped");
        }
    }

    /// Make the next `count` grants fail with [`StoreError::Unavailable`].
    pub fn fail_next_grants(&self, count: u32) {
        self.inner.failing_grants.store(count, Ordering::SeqCst);
    }

    /// Make grants hang until switched off again.
    pub fn stall_grants(&self, stall: bool) {
        self.inner.stall_grants.store(stall, Ordering::SeqCst);
    }

    /// Expire `lease` immediately, as if its TTL had run out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.inner.state.lock();
        let events = state.remove_lease(lease);
        let existed = events.is_some();
        if let Some(events) = events {
            state.notify(events);
        }
        existed
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        state.leases.len()
    }

    /// Live lease ids, ascending.
    pub fn leases(&self) -> Vec<LeaseId> {
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        let mut ids: Vec<LeaseId> = state.leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> StoreStats {
        let inner = &self.inner;
        StoreStats {
            grants: inner.grants.load(Ordering::SeqCst),
            puts: inner.puts.load(Ordering::SeqCst),
            deletes: inner.deletes.load(Ordering::SeqCst),
            revokes: inner.revokes.load(Ordering::SeqCst),
            keep_alives: inner.keep_alives.load(Ordering::SeqCst),
            watches: inner.watches.load(Ordering::SeqCst),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection lost".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Inner {
    /// Remove `lease` once its deadline passes without renewal.
    fn spawn_expiry(
        self: &Arc<Self>,
        lease: LeaseId,
        deadline: Instant,
        ended: CancellationToken,
    ) {
        let inner: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut deadline = deadline;
            loop {
                tokio::select! {
                    _ = ended.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                let next = {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let mut state = inner.state.lock();
                    state.purge_expired(Instant::now());
                    state.leases.get(&lease).map(|entry| entry.deadline)
                };
                match next {
                    // renewed in the meantime
                    Some(next) => deadline = next,
                    None => return,
                }
            }
        });
    }

    /// Renew `lease`; `None` once it is gone or the connection dropped.
    fn renew(&self, lease: LeaseId) -> Option<(KeepAliveAck, Duration)> {
        if self.unavailable.load(Ordering::SeqCst) {
            return None;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);
        let entry = state.leases.get_mut(&lease)?;
        entry.deadline = now + entry.ttl;
        let ack = KeepAliveAck {
            lease,
            ttl: entry.ttl.as_secs() as i64,
        };
        Some((ack, entry.ttl))
    }
}

impl State {
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            trace!(lease = id, "Lease expired");
            if let Some(events) = self.remove_lease(id) {
                self.notify(events);
            }
        }
    }

    fn remove_lease(&mut self, id: LeaseId) -> Option<Vec<WatchEvent>> {
        let lease = self.leases.remove(&id)?;
        lease.ended.cancel();
        let events = lease
            .keys
            .into_iter()
            .filter(|key| self.data.remove(key).is_some())
            .map(|key| WatchEvent::Delete { key })
            .collect();
        Some(events)
    }

    fn notify(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|event| event.key().starts_with(&watcher.prefix))
                .cloned()
                .collect();
            batch.is_empty() || watcher.tx.send(Ok(batch)).is_ok()
        });
    }

    fn unbind(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease
            && let Some(lease) = self.leases.get_mut(&id)
        {
            lease.keys.remove(key);
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        self.inner.grants.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.inner.stall_grants.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let injected = self
            .inner
            .failing_grants
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected grant failure".to_string()));
        }

        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        let deadline = Instant::now() + ttl;
        let ended = CancellationToken::new();
        let id = {
            let mut state = self.inner.state.lock();
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline,
                    keys: BTreeSet::new(),
                    ended: ended.clone(),
                },
            );
            id
        };
        self.inner.spawn_expiry(id, deadline, ended);
        Ok(id)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        self.inner.puts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        if let Some(id) = lease {
            let entry = state.leases.get_mut(&id).ok_or(StoreError::LeaseNotFound(id))?;
            entry.keys.insert(key.to_string());
        }
        let previous = state.data.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(previous) = previous
            && previous.lease != lease
        {
            state.unbind(key, previous.lease);
        }
        state.notify(vec![WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value,
        })]);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        self.check_available()?;

        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        let kvs = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Ok(kvs)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        if let Some(entry) = state.data.remove(key) {
            state.unbind(key, entry.lease);
            state.notify(vec![WatchEvent::Delete {
                key: key.to_string(),
            }]);
        }
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        self.inner.keep_alives.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let ended = {
            let mut state = self.inner.state.lock();
            state.purge_expired(Instant::now());
            state
                .leases
                .get(&lease)
                .map(|entry| entry.ended.clone())
                .ok_or(StoreError::LeaseNotFound(lease))?
        };
        let connection = self.inner.connection.lock().clone();
        let inner = self.inner.clone();
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            while let Some((ack, ttl)) = inner.renew(lease) {
                if tx.send(ack).await.is_err() {
                    break;
                }
                let interval = (ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL);
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ended.cancelled() => break,
                    _ = connection.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            trace!(lease, "Keep-alive stream closed");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        self.inner.watches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        state.watchers.retain(|watcher| !watcher.tx.is_closed());
        state.watchers.push(PrefixWatcher {
            prefix: prefix.to_string(),
            tx,
        });
        drop(state);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.revokes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        let events = state
            .remove_lease(lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        state.notify(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_put_get_delete() {
        let store = InMemoryStore::new();
        store.put("/ns/a/1", b"one".to_vec(), None).await.unwrap();
        store.put("/ns/a/2", b"two".to_vec(), None).await.unwrap();
        store.put("/ns/b/1", b"other".to_vec(), None).await.unwrap();

        let kvs = store.get_prefix("/ns/a").await.unwrap();
        let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/ns/a/1", "/ns/a/2"]);

        store.delete("/ns/a/1").await.unwrap();
        // missing keys delete cleanly
        store.delete("/ns/a/1").await.unwrap();
        assert_eq!(store.get_prefix("/ns/a").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keep_alive() {
        let store = InMemoryStore::new();
        let lease = store.grant(2).await.unwrap();
        store.put("/ns/a/1", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get_prefix("/ns/a").await.unwrap().is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_renews_lease() {
        let store = InMemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        store.put("/ns/a/1", b"v".to_vec(), Some(lease)).await.unwrap();

        let mut acks = store.keep_alive(lease).await.unwrap();
        let first = acks.next().await.unwrap();
        assert_eq!(first, KeepAliveAck { lease, ttl: 3 });

        for _ in 0..10 {
            assert!(acks.next().await.is_some());
        }
        assert_eq!(store.get_prefix("/ns/a").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_removes_keys_and_ends_keep_alive() {
        let store = InMemoryStore::new();
        let lease = store.grant(10).await.unwrap();
        store.put("/ns/a/1", b"v".to_vec(), Some(lease)).await.unwrap();
        let mut acks = store.keep_alive(lease).await.unwrap();
        acks.next().await.unwrap();

        store.revoke(lease).await.unwrap();
        assert!(acks.next().await.is_none());
        assert!(store.get_prefix("/ns").await.unwrap().is_empty());
        assert!(matches!(
            store.revoke(lease).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_with_unknown_lease_fails() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.put("/k", Vec::new(), Some(99)).await,
            Err(StoreError::LeaseNotFound(99))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reports_matching_changes() {
        let store = InMemoryStore::new();
        let mut events = store.watch_prefix("/ns/a").await.unwrap();

        store.put("/ns/b/1", b"x".to_vec(), None).await.unwrap();
        store.put("/ns/a/1", b"y".to_vec(), None).await.unwrap();
        store.delete("/ns/a/1").await.unwrap();

        let batch = events.next().await.unwrap().unwrap();
        assert_eq!(
            batch,
            vec![WatchEvent::Put(KeyValue {
                key: "/ns/a/1".to_string(),
                value: b"y".to_vec()
            })]
        );
        let batch = events.next().await.unwrap().unwrap();
        assert_eq!(
            batch,
            vec![WatchEvent::Delete {
                key: "/ns/a/1".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reaches_watchers_without_other_calls() {
        let store = InMemoryStore::new();
        let lease = store.grant(2).await.unwrap();
        store.put("/ns/a/1", b"v".to_vec(), Some(lease)).await.unwrap();
        let mut events = store.watch_prefix("/ns/a").await.unwrap();

        // nothing but the clock moves from here on
        let batch = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            batch,
            vec![WatchEvent::Delete {
                key: "/ns/a/1".to_string()
            }]
        );
        assert_eq!(store.stats().revokes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lease_outlives_first_deadline() {
        let store = InMemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        store.put("/ns/a/1", b"v".to_vec(), Some(lease)).await.unwrap();
        let mut acks = store.keep_alive(lease).await.unwrap();

        // well past the first deadline
        for _ in 0..10 {
            assert!(acks.next().await.is_some());
        }
        assert_eq!(store.leases(), vec![lease]);

        drop(acks);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.leases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_watchers_are_pruned() {
        let store = InMemoryStore::new();
        let quiet = store.watch_prefix("/quiet").await.unwrap();
        drop(quiet);

        let _events = store.watch_prefix("/ns").await.unwrap();
        assert_eq!(store.inner.state.lock().watchers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop() {
        let store = InMemoryStore::new();
        let lease = store.grant(10).await.unwrap();
        let mut acks = store.keep_alive(lease).await.unwrap();
        let mut events = store.watch_prefix("/").await.unwrap();
        acks.next().await.unwrap();

        store.set_available(false);
        assert!(acks.next().await.is_none());
        assert!(events.next().await.is_none());
        assert!(matches!(
            store.grant(10).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.grant(10).await.is_ok());
        assert_eq!(store.stats().grants, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_grant_failures() {
        let store = InMemoryStore::new();
        store.fail_next_grants(2);
        assert!(store.grant(5).await.is_err());
        assert!(store.grant(5).await.is_err());
        assert!(store.grant(5).await.is_ok());
    }
}
