//! Coordination store abstraction.
//!
//! The registrar and resolver only need a handful of primitives from the
//! store: leases with keepalive, key puts bound to a lease, prefix reads and
//! prefix watches that resume from a revision. [`CoordinationClient`] is that
//! seam; [`MemoryStore`] implements it in-process and `EtcdStore` (feature
//! `etcd`) against an etcd v3 cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{RegistryConfig, StoreBackend};
use crate::error::{RegistryError, Result};

#[cfg(feature = "etcd")]
mod etcd;
mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Store-assigned lease identifier.
pub type LeaseId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Acknowledgement of one successful lease refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub id: LeaseId,
    /// Remaining TTL reported by the store after the refresh.
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub lease: Option<LeaseId>,
    pub mod_revision: i64,
}

/// Consistent read of a prefix together with the store revision it reflects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSnapshot {
    pub revision: i64,
    pub entries: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    #[must_use]
    pub fn revision(&self) -> i64 {
        match self {
            Self::Put(kv) => kv.mod_revision,
            Self::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Stream of keepalive acknowledgements. It ends when the lease is gone.
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveAck>>;

/// Ordered change events under a prefix. An `Err` item is terminal.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// # Errors
    /// Store unreachable or the grant was rejected.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant>;

    /// Start refreshing `lease`. Refreshes only happen while the returned
    /// stream is polled.
    ///
    /// # Errors
    /// [`RegistryError::LeaseNotFound`] if the lease already expired.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke `lease` and delete every key attached to it.
    ///
    /// # Errors
    /// [`RegistryError::LeaseNotFound`] if the lease is unknown.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Write `key`, optionally bound to `lease`. Returns the new revision.
    ///
    /// # Errors
    /// [`RegistryError::LeaseNotFound`] if `lease` is not live.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64>;

    /// # Errors
    /// Store unreachable.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// # Errors
    /// Store unreachable.
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot>;

    /// Delete `key`; returns how many keys were removed (0 or 1).
    ///
    /// # Errors
    /// Store unreachable.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Watch `prefix` starting at `start_revision` (inclusive).
    ///
    /// # Errors
    /// [`RegistryError::Compacted`] if the revision is no longer available.
    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;
}

/// Build the client selected by `cfg.backend`.
///
/// # Errors
/// Returns [`RegistryError::Config`] for invalid settings or a backend not
/// compiled in, and [`RegistryError::Unavailable`] if the store cannot be dialed.
#[cfg_attr(not(feature = "etcd"), allow(clippy::unused_async))]
pub async fn connect(cfg: &RegistryConfig) -> Result<Arc<dyn CoordinationClient>> {
    cfg.validate()?;
    match cfg.backend {
        StoreBackend::Memory => {
            tracing::debug!("using in-process coordination store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "etcd")]
        StoreBackend::Etcd => {
            let store = EtcdStore::connect(cfg).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "etcd"))]
        StoreBackend::Etcd => Err(RegistryError::Config(
            "etcd backend requested but the `etcd` feature is not enabled".to_owned(),
        )),
    }
}
