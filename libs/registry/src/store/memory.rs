use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    CoordinationClient, KeepAliveAck, KeepAliveStream, KeyValue, LeaseGrant, LeaseId,
    PrefixSnapshot, WatchEvent, WatchStream,
};
use crate::error::{RegistryError, Result};

/// Events retained for watch replay before older revisions are compacted.
const HISTORY_LIMIT: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

struct StoredValue {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    mod_revision: i64,
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
    /// Cancelled on revoke or expiry; ends keepalive streams and the expiry task.
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    revision: i64,
    next_lease: LeaseId,
    kv: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchEvent>,
    compacted: i64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
    watch_epoch: Mutex<CancellationToken>,
}

/// In-process coordination store with lease expiry driven by the tokio clock.
///
/// Mirrors the semantics the registry relies on from etcd: monotonically
/// increasing revisions, keys bound to leases disappear when the lease
/// expires or is revoked, and prefix watches resume from a revision as long
/// as it has not been compacted out of the bounded history.
///
/// Cloning is cheap; clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryStore")
            .field("revision", &state.revision)
            .field("keys", &state.kv.len())
            .field("leases", &state.leases.len())
            .finish()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_lease: 1,
                    ..State::default()
                }),
                events,
                available: AtomicBool::new(true),
                watch_epoch: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Terminate every open watch stream with an error, as a dropped
    /// connection would.
    pub fn disconnect_watchers(&self) {
        let old = std::mem::take(&mut *self.inner.watch_epoch.lock());
        old.cancel();
    }

    #[must_use]
    pub fn live_leases(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    #[must_use]
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    fn ensure_available(&self) -> Result<()> {
        self.inner.ensure_available()
    }
}

impl Inner {
    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable(
                "in-memory store marked unavailable".to_owned(),
            ))
        }
    }

    fn refresh(&self, id: LeaseId) -> Result<KeepAliveAck> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.leases.get_mut(&id) {
            Some(lease) if lease.deadline > now => {
                lease.deadline = now + lease.ttl;
                Ok(KeepAliveAck { id, ttl: lease.ttl })
            }
            _ => Err(RegistryError::LeaseNotFound(id)),
        }
    }

    /// Remove the lease if its deadline passed. Returns the next deadline to
    /// wait for, or `None` once the lease is gone.
    fn expire_if_due(&self, id: LeaseId) -> Option<Instant> {
        let mut state = self.state.lock();
        let deadline = state.leases.get(&id)?.deadline;
        if deadline > Instant::now() {
            return Some(deadline);
        }
        let lease = state.leases.remove(&id)?;
        tracing::debug!(lease_id = id, keys = lease.keys.len(), "lease expired");
        state.drop_lease_keys(&lease, &self.events);
        lease.token.cancel();
        None
    }
}

impl State {
    fn record(&mut self, event: WatchEvent, events: &broadcast::Sender<WatchEvent>) {
        self.history.push_back(event.clone());
        while self.history.len() > HISTORY_LIMIT {
            if let Some(old) = self.history.pop_front() {
                self.compacted = old.revision();
            }
        }
        // No receivers is fine.
        let _ = events.send(event);
    }

    fn delete_key(&mut self, key: &str, events: &broadcast::Sender<WatchEvent>) -> bool {
        let Some(old) = self.kv.remove(key) else {
            return false;
        };
        if let Some(lease) = old.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        self.revision += 1;
        let mod_revision = self.revision;
        self.record(
            WatchEvent::Delete {
                key: key.to_owned(),
                mod_revision,
            },
            events,
        );
        true
    }

    fn drop_lease_keys(&mut self, lease: &LeaseEntry, events: &broadcast::Sender<WatchEvent>) {
        for key in &lease.keys {
            self.delete_key(key, events);
        }
    }
}

fn spawn_expiry(inner: Arc<Inner>, id: LeaseId, token: CancellationToken) {
    tokio::spawn(async move {
        let mut deadline = {
            let state = inner.state.lock();
            match state.leases.get(&id) {
                Some(lease) => lease.deadline,
                None => return,
            }
        };
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => {}
            }
            match inner.expire_if_due(id) {
                Some(next) => deadline = next,
                None => return,
            }
        }
    });
}

struct KeepAliveState {
    inner: Arc<Inner>,
    id: LeaseId,
    interval: Duration,
    token: CancellationToken,
    first: bool,
    done: bool,
}

struct WatchState {
    rx: broadcast::Receiver<WatchEvent>,
    prefix: String,
    start_revision: i64,
    epoch: CancellationToken,
    done: bool,
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        self.ensure_available()?;
        let ttl = ttl.max(Duration::from_secs(1));
        let token = CancellationToken::new();
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                    token: token.clone(),
                },
            );
            id
        };
        spawn_expiry(Arc::clone(&self.inner), id, token);
        tracing::debug!(lease_id = id, ttl_secs = ttl.as_secs(), "lease granted");
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.ensure_available()?;
        let (ttl, token) = {
            let state = self.inner.state.lock();
            let entry = state
                .leases
                .get(&lease)
                .ok_or(RegistryError::LeaseNotFound(lease))?;
            (entry.ttl, entry.token.clone())
        };
        let init = KeepAliveState {
            inner: Arc::clone(&self.inner),
            id: lease,
            interval: (ttl / 3).max(MIN_KEEPALIVE_INTERVAL),
            token,
            first: true,
            done: false,
        };
        let stream = futures::stream::unfold(init, |mut st| async move {
            if st.done {
                return None;
            }
            if !st.first {
                tokio::select! {
                    biased;
                    () = st.token.cancelled() => return None,
                    () = tokio::time::sleep(st.interval) => {}
                }
            }
            st.first = false;
            match st.inner.refresh(st.id) {
                Ok(ack) => Some((Ok(ack), st)),
                Err(err) => {
                    st.done = true;
                    Some((Err(err), st))
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.inner.state.lock();
        let entry = state
            .leases
            .remove(&lease)
            .ok_or(RegistryError::LeaseNotFound(lease))?;
        state.drop_lease_keys(&entry, &self.inner.events);
        entry.token.cancel();
        tracing::debug!(lease_id = lease, "lease revoked");
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        self.ensure_available()?;
        let mut state = self.inner.state.lock();
        if let Some(id) = lease {
            let now = Instant::now();
            match state.leases.get(&id) {
                Some(entry) if entry.deadline > now => {}
                _ => return Err(RegistryError::LeaseNotFound(id)),
            }
        }

        // A re-put may move the key to another lease.
        let previous_lease = state.kv.get(key).and_then(|v| v.lease);
        if previous_lease != lease
            && let Some(prev) = previous_lease.and_then(|id| state.leases.get_mut(&id))
        {
            prev.keys.remove(key);
        }
        if let Some(entry) = lease.and_then(|id| state.leases.get_mut(&id)) {
            entry.keys.insert(key.to_owned());
        }

        state.revision += 1;
        let mod_revision = state.revision;
        state.kv.insert(
            key.to_owned(),
            StoredValue {
                value: value.clone(),
                lease,
                mod_revision,
            },
        );
        state.record(
            WatchEvent::Put(KeyValue {
                key: key.to_owned(),
                value,
                lease,
                mod_revision,
            }),
            &self.inner.events,
        );
        Ok(mod_revision)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.ensure_available()?;
        let state = self.inner.state.lock();
        Ok(state.kv.get(key).map(|v| KeyValue {
            key: key.to_owned(),
            value: v.value.clone(),
            lease: v.lease,
            mod_revision: v.mod_revision,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        self.ensure_available()?;
        let state = self.inner.state.lock();
        let entries = state
            .kv
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
                lease: v.lease,
                mod_revision: v.mod_revision,
            })
            .collect();
        Ok(PrefixSnapshot {
            revision: state.revision,
            entries,
        })
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.inner.state.lock();
        Ok(u64::from(state.delete_key(key, &self.inner.events)))
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        self.ensure_available()?;
        let epoch = self.inner.watch_epoch.lock().clone();

        // Replay and subscribe under the same lock so no event falls in between.
        let (replay, rx) = {
            let state = self.inner.state.lock();
            if start_revision > 0 && start_revision <= state.compacted {
                return Err(RegistryError::Compacted(state.compacted));
            }
            let replay: Vec<Result<WatchEvent>> = state
                .history
                .iter()
                .filter(|ev| ev.revision() >= start_revision && ev.key().starts_with(prefix))
                .cloned()
                .map(Ok)
                .collect();
            (replay, self.inner.events.subscribe())
        };

        let init = WatchState {
            rx,
            prefix: prefix.to_owned(),
            start_revision,
            epoch,
            done: false,
        };
        let live = futures::stream::unfold(init, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                let received = tokio::select! {
                    biased;
                    () = st.epoch.cancelled() => {
                        st.done = true;
                        let err = RegistryError::Unavailable("watch connection lost".to_owned());
                        return Some((Err(err), st));
                    }
                    received = st.rx.recv() => received,
                };
                match received {
                    Ok(ev) if ev.revision() >= st.start_revision && ev.key().starts_with(&st.prefix) => {
                        return Some((Ok(ev), st));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        st.done = true;
                        return Some((Err(RegistryError::WatchLagged(skipped)), st));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }
}
