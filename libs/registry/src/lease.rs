//! Lease acquisition and keepalive.
//!
//! A [`LeaseManager`] owns at most one lease per registrar. Every endpoint the
//! registrar writes is bound to it, so a crashed process disappears from the
//! registry once the TTL lapses without a refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::effective_ttl;
use crate::error::{RegistryError, Result, with_timeout};
use crate::store::{CoordinationClient, KeepAliveStream, LeaseGrant, LeaseId};

/// Why a keepalive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveExit {
    /// Owner requested the stop.
    Cancelled,
    /// The store closed the acknowledgement stream (lease revoked or gone).
    Closed,
    /// The store no longer knows the lease; it expired or was revoked.
    Expired,
    /// A refresh failed with a non-retryable error; the lease will expire
    /// after its TTL.
    Failed,
}

const REOPEN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Handle to a running keepalive loop.
#[derive(Debug)]
pub struct KeepAliveHandle {
    lease: LeaseId,
    cancel: CancellationToken,
    join: JoinHandle<KeepAliveExit>,
}

impl KeepAliveHandle {
    #[must_use]
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Whether the loop has exited on its own or after [`Self::stop`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop refreshing and wait for the loop to exit.
    pub async fn stop(self) -> KeepAliveExit {
        self.cancel.cancel();
        self.join.await.unwrap_or_else(|e| {
            tracing::warn!(lease_id = self.lease, error = %e, "keepalive task panicked");
            KeepAliveExit::Failed
        })
    }
}

/// Grants and refreshes the lease that backs a registrar's endpoints.
pub struct LeaseManager {
    client: Arc<dyn CoordinationClient>,
    ttl: Duration,
    request_timeout: Duration,
    lease: OnceCell<LeaseGrant>,
    revoked: AtomicBool,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("ttl", &self.ttl)
            .field("request_timeout", &self.request_timeout)
            .field("lease", &self.lease.get())
            .field("revoked", &self.revoked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// A zero `ttl` selects [`crate::config::DEFAULT_LEASE_TTL`].
    #[must_use]
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            ttl: effective_ttl(ttl),
            request_timeout,
            lease: OnceCell::new(),
            revoked: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The lease granted so far, if any.
    #[must_use]
    pub fn current(&self) -> Option<LeaseGrant> {
        self.lease.get().copied()
    }

    /// Grant the lease, or return the one already granted. Concurrent callers
    /// share a single grant.
    ///
    /// # Errors
    /// Returns the store error or [`RegistryError::Timeout`]; a later call
    /// retries. After [`Self::revoke`] returns [`RegistryError::LeaseNotFound`].
    pub async fn grant(&self) -> Result<LeaseGrant> {
        let grant = self
            .lease
            .get_or_try_init(|| async {
                let grant = with_timeout(
                    "lease grant",
                    self.request_timeout,
                    self.client.grant_lease(self.ttl),
                )
                .await?;
                tracing::info!(
                    lease_id = grant.id,
                    ttl_secs = grant.ttl.as_secs(),
                    "lease granted"
                );
                Ok::<_, RegistryError>(grant)
            })
            .await?;
        if self.revoked.load(Ordering::SeqCst) {
            return Err(RegistryError::LeaseNotFound(grant.id));
        }
        Ok(*grant)
    }

    /// Open the keepalive stream for `lease`.
    ///
    /// # Errors
    /// Returns [`RegistryError::LeaseNotFound`] if the lease already expired.
    pub async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        with_timeout(
            "lease keepalive",
            self.request_timeout,
            self.client.keep_alive(lease),
        )
        .await
    }

    /// Open the keepalive stream and drive it on a background task.
    ///
    /// The task stops when `parent` is cancelled, when the handle is stopped,
    /// or when the store reports the lease gone.
    ///
    /// # Errors
    /// Same as [`Self::keep_alive`].
    pub async fn start_keepalive(
        &self,
        lease: LeaseId,
        parent: &CancellationToken,
    ) -> Result<KeepAliveHandle> {
        let stream = self.keep_alive(lease).await?;
        Ok(spawn_keepalive(
            Arc::clone(&self.client),
            lease,
            stream,
            self.request_timeout,
            parent.child_token(),
        ))
    }

    /// Revoke the lease, deleting every key bound to it. Revoking twice, or
    /// before anything was granted, is a no-op.
    ///
    /// # Errors
    /// Returns the store error or [`RegistryError::Timeout`].
    pub async fn revoke(&self) -> Result<()> {
        let Some(grant) = self.current() else {
            return Ok(());
        };
        if self.revoked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match with_timeout(
            "lease revoke",
            self.request_timeout,
            self.client.revoke_lease(grant.id),
        )
        .await
        {
            Ok(()) => {
                tracing::info!(lease_id = grant.id, "lease revoked");
                Ok(())
            }
            Err(RegistryError::LeaseNotFound(_)) => {
                tracing::debug!(lease_id = grant.id, "lease already expired");
                Ok(())
            }
            Err(e) => {
                // Allow a retry; the TTL still bounds the leak.
                self.revoked.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Consume `stream` until cancelled or until the lease is gone.
///
/// The stream refreshes the lease only while polled, so cancelling the
/// returned handle is enough to let the lease run out. A refresh that fails
/// with [`RegistryError::Unavailable`] or [`RegistryError::Timeout`] reopens
/// the stream with backoff for as long as the store still knows the lease.
#[must_use]
pub fn spawn_keepalive(
    client: Arc<dyn CoordinationClient>,
    lease: LeaseId,
    mut stream: KeepAliveStream,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> KeepAliveHandle {
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        tracing::debug!(lease_id = lease, "keepalive started");
        let exit = loop {
            let failure = tokio::select! {
                biased;
                () = token.cancelled() => break KeepAliveExit::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(ack)) => {
                        tracing::trace!(lease_id = ack.id, ttl_secs = ack.ttl.as_secs(), "lease refreshed");
                        continue;
                    }
                    Some(Err(e)) => e,
                    None => {
                        tracing::warn!(lease_id = lease, "lease keepalive stream closed");
                        break KeepAliveExit::Closed;
                    }
                },
            };
            match reopen_keepalive(client.as_ref(), lease, request_timeout, failure, &token).await {
                Ok(next) => stream = next,
                Err(exit) => break exit,
            }
        };
        tracing::debug!(lease_id = lease, exit = ?exit, "keepalive stopped");
        exit
    });
    KeepAliveHandle {
        lease,
        cancel,
        join,
    }
}

fn is_transient(err: &RegistryError) -> bool {
    matches!(
        err,
        RegistryError::Unavailable(_) | RegistryError::Timeout { .. }
    )
}

async fn reopen_keepalive(
    client: &dyn CoordinationClient,
    lease: LeaseId,
    request_timeout: Duration,
    mut err: RegistryError,
    token: &CancellationToken,
) -> Result<KeepAliveStream, KeepAliveExit> {
    let mut backoff = REOPEN_BACKOFF;
    loop {
        if let RegistryError::LeaseNotFound(_) = err {
            tracing::warn!(lease_id = lease, "lease expired; keepalive stopped");
            return Err(KeepAliveExit::Expired);
        }
        if !is_transient(&err) {
            tracing::warn!(lease_id = lease, error = %err, "lease keepalive failed");
            return Err(KeepAliveExit::Failed);
        }
        tracing::warn!(
            lease_id = lease,
            error = %err,
            retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "lease keepalive interrupted; reopening"
        );
        tokio::select! {
            biased;
            () = token.cancelled() => return Err(KeepAliveExit::Cancelled),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = backoff.saturating_mul(2).min(MAX_REOPEN_BACKOFF);
        match with_timeout("lease keepalive", request_timeout, client.keep_alive(lease)).await {
            Ok(stream) => {
                tracing::info!(lease_id = lease, "lease keepalive resumed");
                return Ok(stream);
            }
            Err(e) => err = e,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(store: &MemoryStore, ttl: Duration) -> LeaseManager {
        LeaseManager::new(Arc::new(store.clone()), ttl, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn grant_is_shared_between_callers() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(5));
        let (a, b) = tokio::join!(lm.grant(), lm.grant());
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.live_leases(), 1);
    }

    #[tokio::test]
    async fn zero_ttl_uses_default() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::ZERO);
        assert_eq!(lm.ttl(), crate::config::DEFAULT_LEASE_TTL);
        assert_eq!(lm.grant().await.unwrap().ttl, crate::config::DEFAULT_LEASE_TTL);
    }

    #[tokio::test]
    async fn grant_failure_is_retryable() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(5));
        store.set_available(false);
        assert!(matches!(lm.grant().await, Err(RegistryError::Unavailable(_))));
        assert!(lm.current().is_none());

        store.set_available(true);
        assert!(lm.grant().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_holds_lease_until_stopped() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(3));
        let grant = lm.grant().await.unwrap();
        let handle = lm
            .start_keepalive(grant.id, &CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.live_leases(), 1);

        assert_eq!(handle.stop().await, KeepAliveExit::Cancelled);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.live_leases(), 0);
    }

    #[tokio::test]
    async fn revoke_closes_keepalive_and_is_idempotent() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(30));
        let grant = lm.grant().await.unwrap();
        let handle = lm
            .start_keepalive(grant.id, &CancellationToken::new())
            .await
            .unwrap();

        lm.revoke().await.unwrap();
        lm.revoke().await.unwrap();
        assert_eq!(store.live_leases(), 0);
        assert_eq!(handle.join.await.unwrap(), KeepAliveExit::Closed);
        assert!(matches!(lm.grant().await, Err(RegistryError::LeaseNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_survives_short_store_outage() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(5));
        let grant = lm.grant().await.unwrap();
        let handle = lm
            .start_keepalive(grant.id, &CancellationToken::new())
            .await
            .unwrap();

        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(store.live_leases(), 1);
        assert!(!handle.is_finished());
        assert_eq!(handle.stop().await, KeepAliveExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_once_lease_expired_during_outage() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(3));
        let grant = lm.grant().await.unwrap();
        let handle = lm
            .start_keepalive(grant.id, &CancellationToken::new())
            .await
            .unwrap();

        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.live_leases(), 0);
        store.set_available(true);

        assert_eq!(handle.join.await.unwrap(), KeepAliveExit::Expired);
    }

    #[tokio::test]
    async fn revoke_of_expired_lease_succeeds() {
        let store = MemoryStore::new();
        let lm = manager(&store, Duration::from_secs(30));
        let grant = lm.grant().await.unwrap();
        store.revoke_lease(grant.id).await.unwrap();
        assert!(lm.revoke().await.is_ok());
    }
}
