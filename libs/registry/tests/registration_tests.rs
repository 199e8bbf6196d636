#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end registration behaviour against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use registry::store::{
    CoordinationClient, KeepAliveStream, KeyValue, LeaseGrant, LeaseId, PrefixSnapshot,
    WatchStream,
};
use registry::{EndpointDescriptor, MemoryStore, Registrar, RegistrarSettings, RegistryError};
use tokio_util::sync::CancellationToken;

fn settings(ttl_secs: u64) -> RegistrarSettings {
    RegistrarSettings {
        lease_ttl: Duration::from_secs(ttl_secs),
        request_timeout: Duration::from_secs(1),
    }
}

fn orders(addr: &str) -> EndpointDescriptor {
    EndpointDescriptor::new("orders", addr).unwrap()
}

#[tokio::test(start_paused = true)]
async fn key_expires_after_keepalive_stops() {
    let store = MemoryStore::new();
    let parent = CancellationToken::new();
    let reg = Registrar::new(Arc::new(store.clone()), settings(5), orders("10.0.0.1:9000"))
        .unwrap()
        .with_cancellation(&parent);
    reg.init().await.unwrap();

    let key = "orders/10.0.0.1:9000";
    let kv = store.get(key).await.unwrap().expect("registered");
    assert_eq!(kv.lease, reg.lease().map(|l| l.id));

    // Heartbeats keep it alive well past the TTL.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(store.get(key).await.unwrap().is_some());

    // Simulated crash: stop refreshing without deregistering.
    parent.cancel();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        store.get(key).await.unwrap().is_some(),
        "key must not vanish before the TTL"
    );
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        store.get(key).await.unwrap().is_none(),
        "key must vanish within the TTL"
    );
}

#[tokio::test(start_paused = true)]
async fn registration_survives_short_store_outage() {
    let store = MemoryStore::new();
    let reg = Registrar::new(Arc::new(store.clone()), settings(5), orders("10.0.0.1:9000")).unwrap();
    reg.init().await.unwrap();

    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    store.set_available(true);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(store.get("orders/10.0.0.1:9000").await.unwrap().is_some());
    assert_eq!(store.live_leases(), 1);
    reg.close().await.unwrap();
}

#[tokio::test]
async fn close_after_failed_revoke_is_retried() {
    let store = MemoryStore::new();
    let reg = Registrar::new(Arc::new(store.clone()), settings(30), orders("10.0.0.1:9000")).unwrap();
    reg.init().await.unwrap();

    store.set_available(false);
    assert!(matches!(reg.close().await, Err(RegistryError::Unavailable(_))));
    store.set_available(true);
    assert_eq!(store.live_leases(), 1);

    reg.close().await.unwrap();
    assert_eq!(store.live_leases(), 0);
    assert!(store.get_prefix("orders/").await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let store = MemoryStore::new();
    let reg = Registrar::new(Arc::new(store.clone()), settings(5), orders("10.0.0.1:9000")).unwrap();
    reg.init().await.unwrap();

    let extra = orders("10.0.0.1:9001").with_version("v2").with_weight(4);
    reg.add_endpoint(&extra).await.unwrap();
    assert_eq!(reg.get_endpoint(&extra).await.unwrap(), Some(extra));
}

#[tokio::test]
async fn close_then_get_returns_not_found() {
    let store = MemoryStore::new();
    let reg = Registrar::new(Arc::new(store.clone()), settings(5), orders("10.0.0.1:9000")).unwrap();
    reg.init().await.unwrap();
    reg.close().await.unwrap();

    assert!(reg.get_endpoint(reg.descriptor()).await.unwrap().is_none());
    assert!(store.get_prefix("orders/").await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn removing_twice_succeeds() {
    let store = MemoryStore::new();
    let reg = Registrar::new(Arc::new(store.clone()), settings(5), orders("10.0.0.1:9000")).unwrap();
    reg.init().await.unwrap();

    reg.remove_endpoint(reg.descriptor()).await.unwrap();
    reg.remove_endpoint(reg.descriptor()).await.unwrap();
    assert!(reg.keys().is_empty());
}

#[tokio::test]
async fn concurrent_registrations_are_all_visible() {
    const N: usize = 16;
    let store = MemoryStore::new();
    let registrars: Vec<Registrar> = (0..N)
        .map(|i| {
            Registrar::new(
                Arc::new(store.clone()),
                settings(5),
                orders(&format!("10.0.0.{i}:9000")),
            )
            .unwrap()
        })
        .collect();

    let results = futures::future::join_all(registrars.iter().map(Registrar::init)).await;
    assert!(results.iter().all(Result::is_ok));

    let snapshot = store.get_prefix("orders/").await.unwrap();
    let mut keys: Vec<_> = snapshot.entries.iter().map(|kv| kv.key.clone()).collect();
    keys.dedup();
    assert_eq!(keys.len(), N);
    assert_eq!(store.live_leases(), N);
}

#[tokio::test]
async fn init_fails_fast_when_store_is_down() {
    let store = MemoryStore::new();
    store.set_available(false);
    let reg = Registrar::new(Arc::new(store.clone()), settings(5), orders("10.0.0.1:9000")).unwrap();
    let err = reg.init().await.unwrap_err();
    assert!(matches!(err, RegistryError::Unavailable(_)), "{err}");
    assert!(reg.lease().is_none());
}

/// Delegates to a [`MemoryStore`] and records the order of mutating calls.
struct RecordingClient {
    inner: MemoryStore,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingClient {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl CoordinationClient for RecordingClient {
    async fn grant_lease(&self, ttl: Duration) -> registry::Result<LeaseGrant> {
        self.record("grant".to_owned());
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> registry::Result<KeepAliveStream> {
        self.record("keepalive".to_owned());
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> registry::Result<()> {
        self.record("revoke".to_owned());
        self.inner.revoke_lease(lease).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> registry::Result<i64> {
        self.record(format!("put {key}"));
        self.inner.put(key, value, lease).await
    }

    async fn get(&self, key: &str) -> registry::Result<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> registry::Result<PrefixSnapshot> {
        self.inner.get_prefix(prefix).await
    }

    async fn delete(&self, key: &str) -> registry::Result<u64> {
        self.record(format!("delete {key}"));
        self.inner.delete(key).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> registry::Result<WatchStream> {
        self.inner.watch_prefix(prefix, start_revision).await
    }
}

#[tokio::test]
async fn lifecycle_order_is_grant_keepalive_put_then_delete_revoke() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let client = Arc::new(RecordingClient {
        inner: MemoryStore::new(),
        calls: Arc::clone(&calls),
    });
    let reg = Registrar::new(client, settings(5), orders("10.0.0.1:9000")).unwrap();
    reg.init().await.unwrap();
    reg.close().await.unwrap();

    assert_eq!(
        *calls.lock(),
        vec![
            "grant",
            "keepalive",
            "put orders/10.0.0.1:9000",
            "delete orders/10.0.0.1:9000",
            "revoke",
        ]
    );
}
