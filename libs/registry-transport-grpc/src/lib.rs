#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! gRPC glue for the registry: a server with an explicit bind/serve/drain
//! lifecycle, a [`ServiceNode`] that registers it, and channels that follow
//! a discovered service.

pub mod client;
pub mod error;
pub mod node;
pub mod server;

pub use client::{GrpcClientConfig, RegistryChannel, dial, parse_target};
pub use error::TransportError;
pub use node::{NodeState, ServiceNode};
pub use server::{RpcServer, ServerSettings};
