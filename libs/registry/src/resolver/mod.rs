//! Client-side discovery: keeps an [`EndpointSet`] per service in sync with
//! the store and picks endpoints from it.
//!
//! Each [`Resolver::resolve`] call starts one background task that reads the
//! service prefix, then follows a watch from the next revision. Any watch
//! failure (error, end of stream, compaction, lag) triggers a fresh prefix
//! read and a new watch, so deletes missed while disconnected are never kept.

pub mod balancer;
pub mod endpoint_set;

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream as SetUpdates;
use tokio_util::sync::CancellationToken;

pub use balancer::Picker;
pub use endpoint_set::{EndpointDiff, EndpointSet, SyncState};

use crate::config::ResolverConfig;
use crate::endpoint::{
    EndpointDescriptor, descriptor_from_key, service_prefix, validate_service_name, version_prefix,
};
use crate::error::{RegistryError, Result, with_timeout};
use crate::store::{CoordinationClient, WatchEvent};

/// Entry point for discovering services.
#[derive(Clone)]
pub struct Resolver {
    client: Arc<dyn CoordinationClient>,
    cfg: ResolverConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    #[must_use]
    pub fn new(client: Arc<dyn CoordinationClient>, cfg: ResolverConfig) -> Self {
        Self {
            client,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop every watch started by this resolver when `parent` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.cfg
    }

    /// Start watching `service_name`. Returns immediately; the set starts in
    /// [`SyncState::Syncing`] and fills once the first read completes.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`RegistryError::Config`] for an invalid service name or version.
    pub fn resolve(&self, service_name: &str) -> Result<ServiceWatch> {
        validate_service_name(service_name)?;
        let prefix = match self.cfg.version.as_deref() {
            Some(version) if !version.is_empty() => {
                validate_service_name(version)?;
                version_prefix(service_name, version)
            }
            _ => service_prefix(service_name),
        };

        let (tx, rx) = watch::channel(Arc::new(EndpointSet::default()));
        let cancel = self.cancel.child_token();
        let task = WatchTask {
            client: Arc::clone(&self.client),
            cfg: self.cfg.clone(),
            service: service_name.to_owned(),
            prefix,
            tx,
        };
        let token = cancel.clone();
        let join = tokio::spawn(async move { task.run(token).await });

        tracing::debug!(service = %service_name, "resolver watch started");
        Ok(ServiceWatch {
            service_name: service_name.to_owned(),
            rx,
            picker: Picker::new(self.cfg.policy),
            cancel,
            task: Some(join),
        })
    }
}

/// Live view of one service's endpoints. Dropping it stops the watch.
#[derive(Debug)]
pub struct ServiceWatch {
    service_name: String,
    rx: watch::Receiver<Arc<EndpointSet>>,
    picker: Picker,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServiceWatch {
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Current snapshot.
    #[must_use]
    pub fn endpoints(&self) -> Arc<EndpointSet> {
        Arc::clone(&*self.rx.borrow())
    }

    /// Receiver notified on every change of the set.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<EndpointSet>> {
        self.rx.clone()
    }

    /// The set as a stream: current value first, then every change.
    #[must_use]
    pub fn updates(&self) -> SetUpdates<Arc<EndpointSet>> {
        SetUpdates::new(self.rx.clone())
    }

    /// Wait until the set satisfies `pred`.
    ///
    /// # Errors
    /// Returns [`RegistryError::Unavailable`] if the watch task stopped first.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&EndpointSet) -> bool,
    ) -> Result<Arc<EndpointSet>> {
        let mut rx = self.rx.clone();
        let set = rx
            .wait_for(|set| pred(set))
            .await
            .map_err(|_| RegistryError::Unavailable("resolver watch stopped".to_owned()))?;
        Ok(Arc::clone(&*set))
    }

    /// Next endpoint per the configured load-balancing policy.
    ///
    /// # Errors
    /// Returns [`RegistryError::NoEndpoints`] when no endpoint is live.
    pub fn pick(&self) -> Result<EndpointDescriptor> {
        let set = self.rx.borrow();
        self.picker
            .pick(&set)
            .ok_or_else(|| RegistryError::NoEndpoints(self.service_name.clone()))
    }

    /// Stop the watch task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(service = %self.service_name, error = %e, "resolver task panicked");
        }
    }
}

impl Drop for ServiceWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchTask {
    client: Arc<dyn CoordinationClient>,
    cfg: ResolverConfig,
    service: String,
    prefix: String,
    tx: watch::Sender<Arc<EndpointSet>>,
}

impl WatchTask {
    async fn run(self, cancel: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            let err = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                err = self.sync_and_follow(&mut failures) => err,
            };

            failures = failures.saturating_add(1);
            tracing::warn!(
                service = %self.service,
                error = %err,
                attempt = failures,
                "resolver lost sync; re-reading endpoints"
            );
            if failures >= self.cfg.max_resync_failures.max(1)
                && self.tx.borrow().state() != SyncState::Degraded
            {
                tracing::error!(
                    service = %self.service,
                    failures,
                    "resolver degraded; publishing empty endpoint set"
                );
                self.tx.send_replace(Arc::new(EndpointSet::degraded()));
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.cfg.resync_backoff(failures)) => {}
            }
        }
        tracing::debug!(service = %self.service, "resolver watch stopped");
    }

    /// Read the prefix, publish it, then apply watch events until the watch
    /// fails. Returns the reason it stopped.
    async fn sync_and_follow(&self, failures: &mut u32) -> RegistryError {
        let timeout = self.cfg.request_timeout();
        let snapshot = match with_timeout(
            "resolver prefix read",
            timeout,
            self.client.get_prefix(&self.prefix),
        )
        .await
        {
            Ok(s) => s,
            Err(e) => return e,
        };
        let mut watch = match with_timeout(
            "resolver watch",
            timeout,
            self.client
                .watch_prefix(&self.prefix, snapshot.revision + 1),
        )
        .await
        {
            Ok(w) => w,
            Err(e) => return e,
        };

        let entries = snapshot
            .entries
            .iter()
            .filter_map(|kv| self.decode(&kv.key, &kv.value).map(|d| (kv.key.clone(), d)));
        let mut current = EndpointSet::from_entries(entries, SyncState::Synced);
        self.publish(&current);
        *failures = 0;
        tracing::debug!(
            service = %self.service,
            revision = snapshot.revision,
            endpoints = current.len(),
            "resolver synced"
        );

        loop {
            let event = match watch.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => return e,
                None => {
                    return RegistryError::Unavailable("watch stream ended".to_owned());
                }
            };
            let changed = match event {
                WatchEvent::Put(kv) => match self.decode(&kv.key, &kv.value) {
                    Some(d) => current.upsert(kv.key, d),
                    None => false,
                },
                WatchEvent::Delete { key, .. } => current.remove(&key),
            };
            if changed {
                self.publish(&current);
            }
        }
    }

    fn decode(&self, key: &str, value: &[u8]) -> Option<EndpointDescriptor> {
        match EndpointDescriptor::decode(value) {
            Ok(d) => Some(d),
            Err(e) => {
                let fallback = descriptor_from_key(key);
                tracing::warn!(
                    service = %self.service,
                    key = %key,
                    error = %e,
                    recovered = fallback.is_some(),
                    "undecodable endpoint value"
                );
                fallback
            }
        }
    }

    fn publish(&self, set: &EndpointSet) {
        let previous = self.tx.send_replace(Arc::new(set.clone()));
        let diff = set.diff(&previous);
        if !diff.is_empty() {
            tracing::info!(
                service = %self.service,
                added = ?diff.added,
                removed = ?diff.removed,
                "endpoint set changed"
            );
        }
    }
}
