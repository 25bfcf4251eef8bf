//! Lodestar etcd Integration Tests
//!
//! These tests require a running etcd server.
//!
//! To run these tests:
//! 1. Start etcd (e.g., `docker run -p 2379:2379 quay.io/coreos/etcd:v3.5.17 etcd
//!    --listen-client-urls http://0.0.0.0:2379 --advertise-client-urls http://127.0.0.1:2379`)
//! 2. Run: cargo test -p lodestar-client --features etcd --test etcd_test -- --ignored

#![cfg(feature = "etcd")]

use std::sync::Arc;
use std::time::Duration;

use lodestar_client::store::{EtcdOptions, EtcdStore};
use lodestar_client::{Instance, LeaseState, Registry, RegistryOptions};

const TEST_ENDPOINT: &str = "http://127.0.0.1:2379";

async fn connect() -> EtcdStore {
    let options = EtcdOptions {
        endpoints: vec![TEST_ENDPOINT.to_string()],
        ..EtcdOptions::default()
    };
    EtcdStore::connect(&options).await.unwrap()
}

fn test_options() -> RegistryOptions {
    RegistryOptions::default()
        .with_namespace(format!("/lodestar-test-{}", std::process::id()))
        .with_ttl(Duration::from_secs(2))
}

#[tokio::test]
#[ignore]
async fn test_register_resolve_deregister() {
    let store = connect().await;
    let registry = Registry::new(Arc::new(store), test_options()).unwrap();
    let instance = Instance::new("i1", "orders").with_endpoint("grpc://10.0.0.1:9000");

    registry.register(&instance).await.unwrap();
    let mut state = registry.subscribe();
    state
        .wait_for(|s| *s == LeaseState::KeepAliveOk)
        .await
        .unwrap();

    // outlive the TTL a few times over
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(registry.get_service("orders").await.unwrap(), vec![instance.clone()]);

    registry.deregister(&instance).await.unwrap();
    assert!(registry.get_service("orders").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_watch_sees_registration() {
    let store = connect().await;
    let registry = Registry::new(Arc::new(store), test_options()).unwrap();
    let instance = Instance::new("i1", "inventory");

    let mut watcher = registry.watch("inventory").await.unwrap();
    assert!(watcher.next().await.unwrap().is_empty());

    registry.register(&instance).await.unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), watcher.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot, vec![instance.clone()]);

    registry.deregister(&instance).await.unwrap();
    watcher.stop().unwrap();
}
