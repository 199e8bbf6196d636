use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, Watcher,
};
use etcd_tonic::Code;
use futures::StreamExt;

use super::{
    CoordinationClient, KeepAliveAck, KeepAliveStream, KeyValue, LeaseGrant, LeaseId,
    PrefixSnapshot, WatchEvent, WatchStream,
};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// [`CoordinationClient`] backed by an etcd v3 cluster.
///
/// `etcd_client::Client` is a cheap handle over one multiplexed channel; each
/// call clones it because the generated stubs take `&mut self`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Dial the configured endpoints.
    ///
    /// # Errors
    /// Returns [`RegistryError::Unavailable`] if no endpoint answers within the
    /// dial timeout.
    pub async fn connect(cfg: &RegistryConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(cfg.dial_timeout())
            .with_timeout(cfg.request_timeout());
        let client = Client::connect(&cfg.endpoints, Some(options))
            .await
            .map_err(|e| {
                RegistryError::Unavailable(format!(
                    "failed to connect to etcd at {}: {e}",
                    cfg.endpoints.join(",")
                ))
            })?;
        tracing::info!(endpoints = ?cfg.endpoints, "connected to etcd");
        Ok(Self { client })
    }

    /// Wrap an already connected client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_err(op: &str, err: etcd_client::Error) -> RegistryError {
    match err {
        etcd_client::Error::GRpcStatus(status)
            if matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded) =>
        {
            RegistryError::Unavailable(format!("{op}: {}", status.message()))
        }
        etcd_client::Error::TransportError(e) => RegistryError::Unavailable(format!("{op}: {e}")),
        other => RegistryError::Store(format!("{op}: {other}")),
    }
}

fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::GRpcStatus(status)
        if status.code() == Code::NotFound || status.message().contains("lease not found"))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| RegistryError::Store(format!("non UTF-8 key: {e}")))?
        .to_owned();
    Ok(KeyValue {
        key,
        value: kv.value().to_vec(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
        mod_revision: kv.mod_revision(),
    })
}

fn ttl_from_secs(secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(secs).unwrap_or_default())
}

struct KeepAliveState {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    id: LeaseId,
    interval: Duration,
    first: bool,
    done: bool,
}

struct WatchState {
    // Dropping the watcher cancels the server-side watch.
    _watcher: Watcher,
    stream: etcd_client::WatchStream,
    pending: VecDeque<WatchEvent>,
    done: bool,
}

#[async_trait]
impl CoordinationClient for EtcdStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let resp = self
            .client
            .clone()
            .lease_grant(secs, None)
            .await
            .map_err(|e| map_err("lease grant", e))?;
        Ok(LeaseGrant {
            id: resp.id(),
            ttl: ttl_from_secs(resp.ttl()),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (keeper, stream) = self
            .client
            .clone()
            .lease_keep_alive(lease)
            .await
            .map_err(|e| map_err("lease keepalive", e))?;
        let ttl = self
            .client
            .clone()
            .lease_time_to_live(lease, None)
            .await
            .map_err(|e| map_err("lease ttl", e))?
            .granted_ttl();
        let init = KeepAliveState {
            keeper,
            stream,
            id: lease,
            interval: (ttl_from_secs(ttl) / 3).max(MIN_KEEPALIVE_INTERVAL),
            first: true,
            done: false,
        };
        let acks = futures::stream::unfold(init, |mut st| async move {
            if st.done {
                return None;
            }
            if !st.first {
                tokio::time::sleep(st.interval).await;
            }
            st.first = false;
            let result = match st.keeper.keep_alive().await {
                Ok(()) => st.stream.message().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(resp)) if resp.ttl() > 0 => Some((
                    Ok(KeepAliveAck {
                        id: resp.id(),
                        ttl: ttl_from_secs(resp.ttl()),
                    }),
                    st,
                )),
                // A zero TTL is how etcd reports an expired lease.
                Ok(Some(_)) => {
                    st.done = true;
                    Some((Err(RegistryError::LeaseNotFound(st.id)), st))
                }
                Ok(None) => None,
                Err(e) => {
                    st.done = true;
                    Some((Err(map_err("lease keepalive", e)), st))
                }
            }
        });
        Ok(acks.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        match self.client.clone().lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Err(RegistryError::LeaseNotFound(lease)),
            Err(e) => Err(map_err("lease revoke", e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        match self.client.clone().put(key, value, options).await {
            Ok(resp) => Ok(resp.header().map_or(0, etcd_client::ResponseHeader::revision)),
            Err(e) if lease.is_some() && is_lease_not_found(&e) => {
                Err(RegistryError::LeaseNotFound(lease.unwrap_or_default()))
            }
            Err(e) => Err(map_err("put", e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self
            .client
            .clone()
            .get(key, None)
            .await
            .map_err(|e| map_err("get", e))?;
        resp.kvs().first().map(convert_kv).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| map_err("get prefix", e))?;
        let revision = resp.header().map_or(0, etcd_client::ResponseHeader::revision);
        let entries = resp
            .kvs()
            .iter()
            .map(convert_kv)
            .collect::<Result<Vec<_>>>()?;
        Ok(PrefixSnapshot { revision, entries })
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let resp = self
            .client
            .clone()
            .delete(key, None)
            .await
            .map_err(|e| map_err("delete", e))?;
        Ok(u64::try_from(resp.deleted()).unwrap_or_default())
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, stream) = self
            .client
            .clone()
            .watch(prefix, Some(options))
            .await
            .map_err(|e| map_err("watch", e))?;

        let init = WatchState {
            _watcher: watcher,
            stream,
            pending: VecDeque::new(),
            done: false,
        };
        let events = futures::stream::unfold(init, |mut st| async move {
            loop {
                if let Some(ev) = st.pending.pop_front() {
                    return Some((Ok(ev), st));
                }
                if st.done {
                    return None;
                }
                let resp = match st.stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return None,
                    Err(e) => {
                        st.done = true;
                        return Some((Err(map_err("watch", e)), st));
                    }
                };
                if resp.compact_revision() > 0 {
                    st.done = true;
                    return Some((Err(RegistryError::Compacted(resp.compact_revision())), st));
                }
                if resp.canceled() {
                    st.done = true;
                    let reason = resp.cancel_reason().to_owned();
                    let err = RegistryError::Unavailable(format!("watch canceled: {reason}"));
                    return Some((Err(err), st));
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let converted = match convert_kv(kv) {
                        Ok(kv) => kv,
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping undecodable watch event");
                            continue;
                        }
                    };
                    let ev = match event.event_type() {
                        EventType::Put => WatchEvent::Put(converted),
                        EventType::Delete => WatchEvent::Delete {
                            key: converted.key,
                            mod_revision: converted.mod_revision,
                        },
                    };
                    st.pending.push_back(ev);
                }
            }
        });
        Ok(events.boxed())
    }
}
