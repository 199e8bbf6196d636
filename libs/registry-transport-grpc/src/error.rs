use std::net::SocketAddr;

use registry::RegistryError;

use crate::node::NodeState;

/// Errors from the server lifecycle and the client channel pool.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC server failed: {0}")]
    Serve(#[from] tonic::transport::Error),

    #[error("cannot go from {from} to {to}")]
    InvalidState { from: NodeState, to: NodeState },

    #[error("invalid dial target '{0}', expected registry:///<service>")]
    InvalidTarget(String),

    #[error("drain did not finish within {}ms", .0.as_millis())]
    DrainTimeout(std::time::Duration),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl TransportError {
    pub(crate) fn bind(addr: impl ToString, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

/// Parse a `host:port` listen address.
///
/// # Errors
/// Returns [`TransportError::Config`] when `addr` is not a socket address.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.parse::<SocketAddr>()
        .map_err(|e| TransportError::Config(format!("invalid listen address '{addr}': {e}")))
}
