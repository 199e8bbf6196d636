//! gRPC server lifecycle: bind, serve until closed, drain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use registry::{EndpointDescriptor, ServiceConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;

use crate::error::{TransportError, parse_listen_addr};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity and listen settings of one served instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub service_name: String,
    pub version: String,
    /// Address advertised to clients. A `:0` port is replaced by the bound one.
    pub address: String,
    /// Where to bind; defaults to `address`.
    pub listen_addr: Option<String>,
    pub weight: u32,
    /// Upper bound on waiting for in-flight RPCs during [`RpcServer::close`].
    pub drain_timeout: Duration,
}

impl ServerSettings {
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            version: version.into(),
            address: address.into(),
            listen_addr: None,
            weight: 1,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// # Errors
    /// Returns [`TransportError::Config`] when name, version or address is empty.
    pub fn validate(&self) -> Result<(), TransportError> {
        for (field, value) in [
            ("service name", &self.service_name),
            ("service version", &self.version),
            ("service address", &self.address),
        ] {
            if value.trim().is_empty() {
                return Err(TransportError::Config(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    fn bind_addr(&self) -> &str {
        self.listen_addr.as_deref().unwrap_or(&self.address)
    }

    /// Address to register once the listener is bound at `bound`.
    #[must_use]
    pub fn advertised_address(&self, bound: SocketAddr) -> String {
        match self.address.rsplit_once(':') {
            Some((host, "0")) => format!("{host}:{}", bound.port()),
            _ => self.address.clone(),
        }
    }

    /// Descriptor registered for this server once bound at `bound`.
    ///
    /// # Errors
    /// Returns [`registry::RegistryError::Config`] if the resulting descriptor
    /// is malformed.
    pub fn descriptor(&self, bound: SocketAddr) -> registry::Result<EndpointDescriptor> {
        let descriptor = EndpointDescriptor::new(&self.service_name, self.advertised_address(bound))?
            .with_version(&self.version)
            .with_weight(self.weight);
        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl From<&ServiceConfig> for ServerSettings {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            listen_addr: cfg.listen_addr.clone(),
            weight: cfg.weight.unwrap_or(1),
            ..Self::new(&cfg.name, &cfg.version, &cfg.address)
        }
    }
}

/// A tonic server with an explicit bind step and bounded graceful shutdown.
pub struct RpcServer {
    settings: ServerSettings,
    listener: Mutex<Option<TcpListener>>,
    bound: Mutex<Option<SocketAddr>>,
    routes: Mutex<Option<Routes>>,
    cancel: CancellationToken,
    serving: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("settings", &self.settings)
            .field("bound", &*self.bound.lock())
            .field("serving", &self.serving.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RpcServer {
    /// # Errors
    /// Returns [`TransportError::Config`] for empty name, version or address.
    pub fn new(settings: ServerSettings) -> Result<Self, TransportError> {
        settings.validate()?;
        Ok(Self {
            settings,
            listener: Mutex::new(None),
            bound: Mutex::new(None),
            routes: Mutex::new(None),
            cancel: CancellationToken::new(),
            serving: AtomicBool::new(false),
            stopped: watch::Sender::new(false),
        })
    }

    /// Serve on an already bound listener instead of binding `listen_addr`.
    #[must_use]
    pub fn with_listener(self, listener: TcpListener) -> Self {
        *self.listener.lock() = Some(listener);
        self
    }

    /// The services to dispatch to.
    #[must_use]
    pub fn with_routes(self, routes: Routes) -> Self {
        *self.routes.lock() = Some(routes);
        self
    }

    /// Shut the server down when `parent` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    #[must_use]
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Bind the listener (or adopt the supplied one). Binding twice returns
    /// the first address.
    ///
    /// # Errors
    /// Returns [`TransportError::Bind`] if the address cannot be bound.
    pub async fn bind(&self) -> Result<SocketAddr, TransportError> {
        if let Some(addr) = *self.bound.lock() {
            return Ok(addr);
        }

        let supplied = self.listener.lock().take();
        let listener = match supplied {
            Some(listener) => listener,
            None => {
                let addr = parse_listen_addr(self.settings.bind_addr())?;
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| TransportError::bind(addr, e))?
            }
        };
        let addr = listener.local_addr()?;
        *self.listener.lock() = Some(listener);
        *self.bound.lock() = Some(addr);

        tracing::info!(
            service = %self.settings.service_name,
            bound_addr = %addr,
            transport = "tcp",
            "gRPC server listening"
        );
        Ok(addr)
    }

    /// Bind if needed, then serve until [`Self::close`] or the parent token.
    ///
    /// # Errors
    /// Bind errors, a second concurrent run, or a transport failure.
    pub async fn run_grpc_server(&self) -> Result<(), TransportError> {
        self.bind().await?;
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Config("server is already running".to_owned()));
        }
        let Some(listener) = self.listener.lock().take() else {
            self.stopped.send_replace(true);
            return Err(TransportError::Config("listener already consumed".to_owned()));
        };
        let routes = self
            .routes
            .lock()
            .take()
            .unwrap_or_else(|| RoutesBuilder::default().routes());

        let cancel = self.cancel.clone();
        let incoming = TcpListenerStream::new(listener);
        let result = Server::builder()
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, async move {
                cancel.cancelled().await;
            })
            .await;

        self.stopped.send_replace(true);
        match &result {
            Ok(()) => tracing::info!(service = %self.settings.service_name, "gRPC server stopped"),
            Err(e) => {
                tracing::error!(service = %self.settings.service_name, error = %e, "gRPC server failed");
            }
        }
        result.map_err(TransportError::from)
    }

    /// Stop accepting connections and wait up to `drain_timeout` for
    /// in-flight RPCs to finish.
    ///
    /// # Errors
    /// Returns [`TransportError::DrainTimeout`] if the drain did not finish.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        if !self.is_serving() {
            // Never served: just release the socket.
            self.listener.lock().take();
            return Ok(());
        }

        let mut stopped = self.stopped.subscribe();
        let drain = self.settings.drain_timeout;
        match tokio::time::timeout(drain, stopped.wait_for(|s| *s)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    service = %self.settings.service_name,
                    drain_timeout_ms = u64::try_from(drain.as_millis()).unwrap_or(u64::MAX),
                    "gRPC server drain timed out"
                );
                Err(TransportError::DrainTimeout(drain))
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_identity() {
        for settings in [
            ServerSettings::new("", "v1", "127.0.0.1:0"),
            ServerSettings::new("orders", "", "127.0.0.1:0"),
            ServerSettings::new("orders", "v1", " "),
        ] {
            assert!(matches!(
                RpcServer::new(settings),
                Err(TransportError::Config(_))
            ));
        }
    }

    #[test]
    fn advertised_address_takes_bound_port() {
        let s = ServerSettings::new("orders", "v1", "10.0.0.1:0");
        let bound: SocketAddr = "0.0.0.0:40123".parse().unwrap();
        assert_eq!(s.advertised_address(bound), "10.0.0.1:40123");

        let fixed = ServerSettings::new("orders", "v1", "10.0.0.1:9000");
        assert_eq!(fixed.advertised_address(bound), "10.0.0.1:9000");

        let d = s.descriptor(bound).unwrap();
        assert_eq!(d.registry_key(), "orders/v1/10.0.0.1:40123");
    }

    #[tokio::test]
    async fn bind_is_idempotent() {
        let server = RpcServer::new(ServerSettings::new("orders", "v1", "127.0.0.1:0")).unwrap();
        let a = server.bind().await.unwrap();
        let b = server.bind().await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a.port(), 0);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn bind_error_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let server = RpcServer::new(ServerSettings::new("orders", "v1", addr)).unwrap();
        assert!(matches!(
            server.bind().await,
            Err(TransportError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn supplied_listener_is_used() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let expected = listener.local_addr().unwrap();
        let server = RpcServer::new(ServerSettings::new("orders", "v1", "127.0.0.1:1"))
            .unwrap()
            .with_listener(listener);
        assert_eq!(server.bind().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn run_until_closed() {
        let server = std::sync::Arc::new(
            RpcServer::new(ServerSettings::new("orders", "v1", "127.0.0.1:0")).unwrap(),
        );
        let task = {
            let server = std::sync::Arc::clone(&server);
            tokio::spawn(async move { server.run_grpc_server().await })
        };
        while !server.is_serving() {
            tokio::task::yield_now().await;
        }
        server.close().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
