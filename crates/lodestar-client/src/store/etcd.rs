//! etcd v3 coordination store
//!
//! Wraps a shared [`etcd_client::Client`]. The client is cheap to clone, so
//! every call works on its own clone instead of locking a shared handle.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{
    CoordinationStore, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreResult,
    WatchEvent, WatchStream,
};

/// Connection settings for [`EtcdStore`].
#[derive(Clone, Debug)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl EtcdOptions {
    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(self.connect_timeout)
            .with_timeout(self.request_timeout);
        if let (Some(user), Some(password)) = (&self.username, &self.password) {
            options = options.with_user(user.clone(), password.clone());
        }
        options
    }
}

/// [`CoordinationStore`] backed by an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(options: &EtcdOptions) -> StoreResult<Self> {
        info!(endpoints = ?options.endpoints, "Connecting to etcd");
        let client = Client::connect(&options.endpoints, Some(options.connect_options())).await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();
        Ok(kvs)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let (mut keeper, mut responses) = self.client.clone().lease_keep_alive(lease).await?;
        let (tx, rx) = mpsc::channel(8);

        // etcd only renews on request, so drive one round trip per TTL/3.
        tokio::spawn(async move {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease, error = %e, "Failed to send lease keep-alive");
                    break;
                }
                let ttl = match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => resp.ttl(),
                    Ok(Some(_)) => {
                        debug!(lease, "Lease expired on the server");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(lease, error = %e, "Lease keep-alive stream failed");
                        break;
                    }
                };
                if tx.send(KeepAliveAck { lease, ttl }).await.is_err() {
                    break;
                }
                let interval = Duration::from_secs((ttl / 3).max(1) as u64);
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let (mut watcher, mut stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;
        let (tx, rx) = mpsc::channel::<StoreResult<Vec<WatchEvent>>>(64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        if let Err(e) = watcher.cancel().await {
                            debug!(error = %e, "Failed to cancel etcd watch");
                        }
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                debug!("etcd watch cancelled by the server");
                                break;
                            }
                            let events: Vec<WatchEvent> = resp
                                .events()
                                .iter()
                                .filter_map(|event| {
                                    let kv = event.kv()?;
                                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                                    Some(match event.event_type() {
                                        EventType::Put => WatchEvent::Put(KeyValue {
                                            key,
                                            value: kv.value().to_vec(),
                                        }),
                                        EventType::Delete => WatchEvent::Delete { key },
                                    })
                                })
                                .collect();
                            if events.is_empty() {
                                continue;
                            }
                            if tx.send(Ok(events)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.client.clone().lease_revoke(lease).await?;
        Ok(())
    }
}
