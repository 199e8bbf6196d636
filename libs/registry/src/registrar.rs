//! Server-side registration of endpoints under a single lease.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::endpoint::EndpointDescriptor;
use crate::error::{RegistryError, Result, with_timeout};
use crate::lease::{KeepAliveHandle, LeaseManager};
use crate::store::{CoordinationClient, LeaseGrant};

/// Lease and timeout settings for a [`Registrar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrarSettings {
    /// Zero selects the default TTL.
    pub lease_ttl: Duration,
    pub request_timeout: Duration,
}

impl Default for RegistrarSettings {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for RegistrarSettings {
    fn from(cfg: &RegistryConfig) -> Self {
        Self {
            lease_ttl: cfg.lease_ttl(),
            request_timeout: cfg.request_timeout(),
        }
    }
}

/// Writes endpoint descriptors bound to one lease and keeps that lease alive.
///
/// Lifecycle: [`Registrar::init`] grants the lease, starts the keepalive loop
/// and writes the registrar's own endpoint. [`Registrar::close`] deletes what
/// was written and revokes the lease. Additional endpoints may be added in
/// between; all of them share the lease.
pub struct Registrar {
    client: Arc<dyn CoordinationClient>,
    lease: LeaseManager,
    descriptor: EndpointDescriptor,
    request_timeout: Duration,
    keepalive: tokio::sync::Mutex<Option<KeepAliveHandle>>,
    keys: parking_lot::Mutex<BTreeSet<String>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    /// Set once a `close` completed every step without error.
    close_done: tokio::sync::Mutex<bool>,
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("descriptor", &self.descriptor)
            .field("lease", &self.lease)
            .field("keys", &*self.keys.lock())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Registrar {
    /// # Errors
    /// Returns [`RegistryError::Config`] if `descriptor` is malformed.
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        settings: RegistrarSettings,
        descriptor: EndpointDescriptor,
    ) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self {
            lease: LeaseManager::new(
                Arc::clone(&client),
                settings.lease_ttl,
                settings.request_timeout,
            ),
            client,
            descriptor,
            request_timeout: settings.request_timeout,
            keepalive: tokio::sync::Mutex::new(None),
            keys: parking_lot::Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_done: tokio::sync::Mutex::new(false),
        })
    }

    /// Tie the keepalive loop to `parent`: cancelling it stops refreshing and
    /// lets the lease expire.
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    #[must_use]
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn lease(&self) -> Option<LeaseGrant> {
        self.lease.current()
    }

    /// Keys currently owned by this registrar.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().iter().cloned().collect()
    }

    /// Grant the lease, start the keepalive loop and register the own endpoint.
    ///
    /// # Errors
    /// Any store error on the way; nothing is left registered on failure other
    /// than what the lease TTL cleans up.
    pub async fn init(&self) -> Result<()> {
        let grant = self.lease.grant().await?;
        self.ensure_keepalive(grant).await?;
        let descriptor = self.descriptor.clone();
        self.add_endpoint(&descriptor).await?;
        tracing::info!(
            service = %self.descriptor.service_name,
            address = %self.descriptor.address,
            lease_id = grant.id,
            "registrar initialized"
        );
        Ok(())
    }

    /// Write `descriptor` under the registrar's lease. Returns once the store
    /// acknowledged the write.
    ///
    /// # Errors
    /// [`RegistryError::Config`] for a malformed descriptor or a closed
    /// registrar, otherwise the store error.
    pub async fn add_endpoint(&self, descriptor: &EndpointDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Config("registrar is closed".to_owned()));
        }
        let grant = self.lease.grant().await?;
        let key = descriptor.registry_key();
        let value = descriptor.encode()?;

        let revision = with_timeout(
            "endpoint put",
            self.request_timeout,
            self.client.put(&key, value, Some(grant.id)),
        )
        .await?;
        self.keys.lock().insert(key.clone());
        self.ensure_keepalive(grant).await?;

        tracing::info!(
            key = %key,
            lease_id = grant.id,
            revision,
            "endpoint registered"
        );
        Ok(())
    }

    /// Delete the key of `descriptor`. Removing an absent key succeeds.
    ///
    /// # Errors
    /// Store error or [`RegistryError::Timeout`].
    pub async fn remove_endpoint(&self, descriptor: &EndpointDescriptor) -> Result<()> {
        let key = descriptor.registry_key();
        let deleted = with_timeout(
            "endpoint delete",
            self.request_timeout,
            self.client.delete(&key),
        )
        .await?;
        self.keys.lock().remove(&key);
        tracing::info!(key = %key, deleted, "endpoint removed");
        Ok(())
    }

    /// Read back the stored descriptor for `descriptor`'s key.
    ///
    /// # Errors
    /// Store error, [`RegistryError::Timeout`], or [`RegistryError::Codec`] for
    /// a value that is not a descriptor.
    pub async fn get_endpoint(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<Option<EndpointDescriptor>> {
        let key = descriptor.registry_key();
        let kv = with_timeout("endpoint get", self.request_timeout, self.client.get(&key)).await?;
        kv.map(|kv| EndpointDescriptor::decode(&kv.value))
            .transpose()
    }

    /// Deregister everything and revoke the lease.
    ///
    /// Key deletion is best effort: failures are logged and do not prevent the
    /// revoke, which removes the keys anyway. The first error encountered is
    /// returned after every step ran. Keys that could not be deleted and a
    /// failed revoke are retried by the next `close`; once a `close` succeeded
    /// further calls are no-ops.
    ///
    /// # Errors
    /// The first deletion or revoke error.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut done = self.close_done.lock().await;
        if *done {
            return Ok(());
        }
        let mut first_err: Option<RegistryError> = None;

        let keys = self.keys();
        for key in &keys {
            let res = with_timeout(
                "endpoint delete",
                self.request_timeout,
                self.client.delete(key),
            )
            .await;
            match res {
                Ok(_) => {
                    self.keys.lock().remove(key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to delete endpoint during close");
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Some(handle) = self.keepalive.lock().await.take() {
            let exit = handle.stop().await;
            tracing::debug!(exit = ?exit, "keepalive stopped for close");
        }

        match self.lease.revoke().await {
            // Revoking deletes whatever the loop above could not.
            Ok(()) => self.keys.lock().clear(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to revoke lease during close");
                first_err.get_or_insert(e);
            }
        }
        self.cancel.cancel();

        tracing::info!(
            service = %self.descriptor.service_name,
            keys = keys.len(),
            clean = first_err.is_none(),
            "registrar closed"
        );
        match first_err {
            Some(e) => Err(e),
            None => {
                *done = true;
                Ok(())
            }
        }
    }

    async fn ensure_keepalive(&self, grant: LeaseGrant) -> Result<()> {
        let mut slot = self.keepalive.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let handle = self.lease.start_keepalive(grant.id, &self.cancel).await?;
        *slot = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::store::{
        KeepAliveStream, KeyValue, LeaseId, MemoryStore, PrefixSnapshot, WatchStream,
    };

    fn registrar(store: &MemoryStore) -> Registrar {
        let d = EndpointDescriptor::new("orders", "10.0.0.1:9000").unwrap();
        Registrar::new(Arc::new(store.clone()), RegistrarSettings::default(), d).unwrap()
    }

    #[test]
    fn rejects_malformed_descriptor() {
        let d = EndpointDescriptor {
            service_name: String::new(),
            address: "10.0.0.1:9000".to_owned(),
            version: None,
            weight: 1,
        };
        let res = Registrar::new(
            Arc::new(MemoryStore::new()),
            RegistrarSettings::default(),
            d,
        );
        assert!(matches!(res, Err(RegistryError::Config(_))));
    }

    #[tokio::test]
    async fn init_writes_own_endpoint_and_close_removes_it() {
        let store = MemoryStore::new();
        let reg = registrar(&store);
        reg.init().await.unwrap();

        let stored = reg.get_endpoint(reg.descriptor()).await.unwrap();
        assert_eq!(stored.as_ref(), Some(reg.descriptor()));
        assert_eq!(reg.keys(), vec!["orders/10.0.0.1:9000".to_owned()]);

        reg.close().await.unwrap();
        assert!(reg.get_endpoint(reg.descriptor()).await.unwrap().is_none());
        assert_eq!(store.live_leases(), 0);

        reg.close().await.unwrap();
    }

    #[tokio::test]
    async fn additional_endpoints_share_the_lease() {
        let store = MemoryStore::new();
        let reg = registrar(&store);
        reg.init().await.unwrap();
        let extra = EndpointDescriptor::new("orders", "10.0.0.2:9000")
            .unwrap()
            .with_version("v2");
        reg.add_endpoint(&extra).await.unwrap();

        let lease = reg.lease().unwrap().id;
        let snapshot = store.get_prefix("orders/").await.unwrap();
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.entries.iter().all(|kv| kv.lease == Some(lease)));
        assert_eq!(store.live_leases(), 1);
    }

    #[tokio::test]
    async fn add_after_close_is_rejected() {
        let store = MemoryStore::new();
        let reg = registrar(&store);
        reg.init().await.unwrap();
        reg.close().await.unwrap();
        let res = reg.add_endpoint(reg.descriptor()).await;
        assert!(matches!(res, Err(RegistryError::Config(_))));
    }

    #[tokio::test]
    async fn close_reports_first_error_when_store_is_down() {
        let store = MemoryStore::new();
        let reg = registrar(&store);
        reg.init().await.unwrap();

        store.set_available(false);
        let res = reg.close().await;
        assert!(matches!(res, Err(RegistryError::Unavailable(_))));
        assert_eq!(reg.keys(), vec!["orders/10.0.0.1:9000".to_owned()]);
        store.set_available(true);
    }

    #[tokio::test]
    async fn close_retries_after_failed_revoke() {
        let store = MemoryStore::new();
        let reg = registrar(&store);
        reg.init().await.unwrap();

        store.set_available(false);
        assert!(reg.close().await.is_err());
        assert_eq!(store.live_leases(), 1);

        store.set_available(true);
        reg.close().await.unwrap();
        assert_eq!(store.live_leases(), 0);
        assert!(reg.keys().is_empty());
        assert!(store.get("orders/10.0.0.1:9000").await.unwrap().is_none());

        reg.close().await.unwrap();
    }

    /// Delegates to a [`MemoryStore`] but never opens a keepalive stream.
    struct NoKeepAlive(MemoryStore);

    #[async_trait::async_trait]
    impl CoordinationClient for NoKeepAlive {
        async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
            self.0.grant_lease(ttl).await
        }
        async fn keep_alive(&self, _lease: LeaseId) -> Result<KeepAliveStream> {
            Err(RegistryError::Unavailable("keepalive refused".to_owned()))
        }
        async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
            self.0.revoke_lease(lease).await
        }
        async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
            self.0.put(key, value, lease).await
        }
        async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
            self.0.get(key).await
        }
        async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
            self.0.get_prefix(prefix).await
        }
        async fn delete(&self, key: &str) -> Result<u64> {
            self.0.delete(key).await
        }
        async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
            self.0.watch_prefix(prefix, start_revision).await
        }
    }

    #[tokio::test]
    async fn written_key_is_tracked_when_keepalive_fails_to_start() {
        let store = MemoryStore::new();
        let d = EndpointDescriptor::new("orders", "10.0.0.2:9000").unwrap();
        let reg = Registrar::new(
            Arc::new(NoKeepAlive(store.clone())),
            RegistrarSettings::default(),
            d.clone(),
        )
        .unwrap();

        assert!(matches!(
            reg.add_endpoint(&d).await,
            Err(RegistryError::Timeout { .. } | RegistryError::Unavailable(_))
        ));
        assert_eq!(reg.keys(), vec!["orders/10.0.0.2:9000".to_owned()]);
        assert!(store.get("orders/10.0.0.2:9000").await.unwrap().is_some());

        reg.close().await.unwrap();
        assert!(store.get("orders/10.0.0.2:9000").await.unwrap().is_none());
        assert_eq!(store.live_leases(), 0);
    }
}
