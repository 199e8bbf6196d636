//! A served and registered instance: [`RpcServer`] plus [`Registrar`] with
//! a fixed start and stop order.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use registry::{CoordinationClient, Registrar, RegistrarSettings, Resolver, ResolverConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::server::RpcServer;

/// Lifecycle of a [`ServiceNode`]. There is no way out of `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unconfigured,
    Initialized,
    Serving,
    Draining,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Initialized => "initialized",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Binds, registers, serves and tears down one service instance.
///
/// Start: bind listener, grant lease, start keepalive, write endpoint, serve.
/// Stop: delete endpoint, revoke lease, stop accepting, drain.
pub struct ServiceNode {
    client: Arc<dyn CoordinationClient>,
    server: RpcServer,
    settings: RegistrarSettings,
    registrar: Mutex<Option<Arc<Registrar>>>,
    state: watch::Sender<NodeState>,
    cancel: CancellationToken,
}

impl fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNode")
            .field("server", &self.server)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ServiceNode {
    #[must_use]
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        server: RpcServer,
        settings: RegistrarSettings,
    ) -> Self {
        Self {
            client,
            server,
            settings,
            registrar: Mutex::new(None),
            state: watch::Sender::new(NodeState::Unconfigured),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `parent` stops the keepalive loop and any resolvers created
    /// through [`Self::resolver`]. It does not deregister; use [`Self::close`].
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn server(&self) -> &RpcServer {
        &self.server
    }

    #[must_use]
    pub fn registrar(&self) -> Option<Arc<Registrar>> {
        self.registrar.lock().clone()
    }

    /// A resolver over the same coordination client.
    #[must_use]
    pub fn resolver(&self, cfg: ResolverConfig) -> Resolver {
        Resolver::new(Arc::clone(&self.client), cfg).with_cancellation(&self.cancel)
    }

    fn transition(&self, allowed_from: &[NodeState], to: NodeState) -> Result<(), TransportError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if allowed_from.contains(state) {
                tracing::debug!(from = %state, to = %to, "service node state change");
                *state = to;
                true
            } else {
                result = Err(TransportError::InvalidState { from: *state, to });
                false
            }
        });
        result
    }

    /// Bind the listener and register the bound address.
    ///
    /// # Errors
    /// Bind or registration failure; the node stays `Unconfigured` so `init`
    /// may be retried.
    pub async fn init(&self) -> Result<(), TransportError> {
        if self.state() != NodeState::Unconfigured {
            return Err(TransportError::InvalidState {
                from: self.state(),
                to: NodeState::Initialized,
            });
        }
        let bound = self.server.bind().await?;
        let descriptor = self.server.settings().descriptor(bound)?;
        let registrar = Arc::new(
            Registrar::new(Arc::clone(&self.client), self.settings, descriptor)?
                .with_cancellation(&self.cancel),
        );
        registrar.init().await?;
        *self.registrar.lock() = Some(registrar);
        self.transition(&[NodeState::Unconfigured], NodeState::Initialized)
    }

    /// Serve until [`Self::close`] is called. Calls [`Self::init`] first if
    /// needed.
    ///
    /// # Errors
    /// Init failure, invalid state, or the server's transport error.
    pub async fn run(&self) -> Result<(), TransportError> {
        if self.state() == NodeState::Unconfigured {
            self.init().await?;
        }
        self.transition(&[NodeState::Initialized], NodeState::Serving)?;
        self.server.run_grpc_server().await
    }

    /// Deregister, revoke the lease, then stop the server.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned. Closing a stopped node is a no-op.
    ///
    /// # Errors
    /// The first registrar or server shutdown error.
    pub async fn close(&self) -> Result<(), TransportError> {
        let from = self.state();
        match from {
            NodeState::Stopped => return Ok(()),
            NodeState::Draining => {
                let mut rx = self.state.subscribe();
                if rx.wait_for(|s| *s == NodeState::Stopped).await.is_err() {
                    tracing::debug!("service node dropped while draining");
                }
                return Ok(());
            }
            NodeState::Unconfigured | NodeState::Initialized | NodeState::Serving => {}
        }
        self.transition(
            &[
                NodeState::Unconfigured,
                NodeState::Initialized,
                NodeState::Serving,
            ],
            NodeState::Draining,
        )?;

        let mut first_err: Option<TransportError> = None;
        let registrar = self.registrar.lock().clone();
        if let Some(registrar) = registrar
            && let Err(e) = registrar.close().await
        {
            tracing::warn!(error = %e, "deregistration failed; lease TTL will clean up");
            first_err = Some(e.into());
        }
        if let Err(e) = self.server.close().await {
            first_err.get_or_insert(e);
        }
        self.cancel.cancel();

        self.state.send_replace(NodeState::Stopped);
        tracing::info!(
            service = %self.server.settings().service_name,
            "service node stopped"
        );
        first_err.map_or(Ok(()), Err)
    }
}
