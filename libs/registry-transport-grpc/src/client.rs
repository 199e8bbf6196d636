//! Outbound gRPC channels to a discovered service.
//!
//! [`dial`] resolves `registry:///<service>` through a [`Resolver`] and keeps
//! one lazily connected [`Channel`] per live address. Each call to
//! [`RegistryChannel::pick`] returns the channel of the next endpoint chosen
//! by the resolver's load-balancing policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use registry::{EndpointSet, RegistryError, Resolver, ServiceWatch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tonic::transport::{Channel, Endpoint};

use crate::error::TransportError;

/// Scheme of registry dial targets.
pub const REGISTRY_SCHEME: &str = "registry";

/// Transport settings for channels opened to discovered endpoints.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for individual RPC calls (applied at transport level).
    pub rpc_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub http2_keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(30),
            http2_keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

impl GrpcClientConfig {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Build a tonic `Endpoint` for `address` (`host:port`, plaintext).
///
/// # Errors
/// Returns a transport error if the resulting URI is invalid.
pub fn build_endpoint(
    address: &str,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(format!("http://{address}"))?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(cfg.tcp_keepalive))
        .http2_keep_alive_interval(cfg.http2_keepalive_interval)
        .keep_alive_timeout(cfg.keepalive_timeout)
        .keep_alive_while_idle(true);
    Ok(endpoint)
}

/// Extract the service name from `registry:///<service>`.
///
/// # Errors
/// Returns [`TransportError::InvalidTarget`] for any other shape.
pub fn parse_target(target: &str) -> Result<&str, TransportError> {
    let invalid = || TransportError::InvalidTarget(target.to_owned());
    let rest = target
        .strip_prefix(REGISTRY_SCHEME)
        .and_then(|r| r.strip_prefix(":///"))
        .ok_or_else(invalid)?;
    if rest.is_empty() || rest.contains('/') {
        return Err(invalid());
    }
    Ok(rest)
}

type ChannelMap = Arc<RwLock<BTreeMap<String, Channel>>>;

/// Channel pool following the live endpoint set of one service.
pub struct RegistryChannel {
    watch: ServiceWatch,
    channels: ChannelMap,
    cfg: GrpcClientConfig,
    cancel: CancellationToken,
    sync: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RegistryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryChannel")
            .field("service", &self.watch.service_name())
            .field("addresses", &self.addresses())
            .finish_non_exhaustive()
    }
}

/// Resolve `target` and keep a channel per live endpoint.
///
/// Returns immediately; channels appear as the resolver syncs. Must be called
/// within a tokio runtime.
///
/// # Errors
/// Returns [`TransportError::InvalidTarget`] or a resolver configuration error.
pub fn dial(
    target: &str,
    resolver: &Resolver,
    cfg: &GrpcClientConfig,
) -> Result<RegistryChannel, TransportError> {
    let service = parse_target(target)?;
    let watch = resolver.resolve(service)?;
    let channels: ChannelMap = Arc::default();
    let cancel = CancellationToken::new();

    let sync = ChannelSync {
        rx: watch.subscribe(),
        channels: Arc::clone(&channels),
        cfg: cfg.clone(),
        cancel: cancel.clone(),
        service: service.to_owned(),
    };
    let sync = tokio::spawn(sync.run());

    tracing::debug!(dial_target = %target, "registry channel dialed");
    Ok(RegistryChannel {
        watch,
        channels,
        cfg: cfg.clone(),
        cancel,
        sync: Some(sync),
    })
}

struct ChannelSync {
    rx: tokio::sync::watch::Receiver<Arc<EndpointSet>>,
    channels: ChannelMap,
    cfg: GrpcClientConfig,
    cancel: CancellationToken,
    service: String,
}

impl ChannelSync {
    async fn run(mut self) {
        loop {
            let set = Arc::clone(&*self.rx.borrow_and_update());
            reconcile(&self.channels, &set, &self.cfg, &self.service);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.channels.write().clear();
    }
}

fn reconcile(channels: &ChannelMap, set: &EndpointSet, cfg: &GrpcClientConfig, service: &str) {
    let live = set.addresses();
    let mut map = channels.write();
    map.retain(|addr, _| {
        let keep = live.contains(addr);
        if !keep {
            tracing::debug!(service = %service, address = %addr, "dropping channel");
        }
        keep
    });
    for addr in live {
        if map.contains_key(&addr) {
            continue;
        }
        match build_endpoint(&addr, cfg) {
            Ok(endpoint) => {
                tracing::debug!(service = %service, address = %addr, "adding channel");
                map.insert(addr, endpoint.connect_lazy());
            }
            Err(e) => {
                tracing::warn!(service = %service, address = %addr, error = %e, "invalid endpoint address");
            }
        }
    }
}

impl RegistryChannel {
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.watch.service_name()
    }

    /// The underlying resolver watch.
    #[must_use]
    pub fn endpoints(&self) -> &ServiceWatch {
        &self.watch
    }

    /// Addresses that currently have a channel.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Channel to the next endpoint per the resolver's policy.
    ///
    /// # Errors
    /// `Status::unavailable` when no endpoint is live.
    pub fn pick(&self) -> Result<Channel, Status> {
        let descriptor = self.watch.pick().map_err(|e| {
            if matches!(e, RegistryError::NoEndpoints(_)) {
                Status::unavailable(e.to_string())
            } else {
                Status::internal(e.to_string())
            }
        })?;
        if let Some(channel) = self.channels.read().get(&descriptor.address) {
            return Ok(channel.clone());
        }
        // The sync task has not caught up with the set yet.
        let channel = build_endpoint(&descriptor.address, &self.cfg)
            .map_err(|e| Status::unavailable(format!("invalid endpoint address: {e}")))?
            .connect_lazy();
        let mut map = self.channels.write();
        // Checked under the lock so a concurrent reconcile cannot be undone
        // by re-adding an address it just dropped.
        if self.watch.endpoints().contains_address(&descriptor.address) {
            map.entry(descriptor.address).or_insert(channel.clone());
        }
        Ok(channel)
    }

    /// Stop following the service and drop every channel.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.sync.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "channel sync task panicked");
        }
    }
}

impl Drop for RegistryChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_targets() {
        assert_eq!(parse_target("registry:///orders").unwrap(), "orders");
        for bad in [
            "orders",
            "registry://orders",
            "registry:///",
            "registry:///a/b",
            "dns:///orders",
        ] {
            assert!(
                matches!(parse_target(bad), Err(TransportError::InvalidTarget(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn build_endpoint_succeeds() {
        let cfg = GrpcClientConfig::default();
        assert!(build_endpoint("127.0.0.1:50051", &cfg).is_ok());
    }

    #[test]
    fn build_endpoint_rejects_garbage() {
        let cfg = GrpcClientConfig::default();
        assert!(build_endpoint("not a host", &cfg).is_err());
    }

    #[tokio::test]
    async fn pick_does_not_cache_channel_for_removed_address() {
        use registry::store::CoordinationClient;
        use registry::{EndpointDescriptor, MemoryStore, ResolverConfig};

        let store = MemoryStore::new();
        let resolver = Resolver::new(Arc::new(store.clone()), ResolverConfig::default());
        let d = EndpointDescriptor::new("orders", "127.0.0.1:9000").unwrap();
        store
            .put(&d.registry_key(), d.encode().unwrap(), None)
            .await
            .unwrap();

        let channel = dial("registry:///orders", &resolver, &GrpcClientConfig::default()).unwrap();
        channel.endpoints().wait_for(|s| s.len() == 1).await.unwrap();
        assert!(channel.pick().is_ok());

        store.delete(&d.registry_key()).await.unwrap();
        channel.endpoints().wait_for(EndpointSet::is_empty).await.unwrap();
        assert!(channel.pick().is_err());
        for _ in 0..100 {
            if channel.addresses().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(channel.addresses().is_empty());
        channel.close().await;
    }

    #[test]
    fn config_builder() {
        let cfg = GrpcClientConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_rpc_timeout(Duration::from_secs(5));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(5));
    }
}
