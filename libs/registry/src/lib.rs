#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Lease-backed service registration and discovery.
//!
//! Servers publish an [`EndpointDescriptor`] under a key bound to a lease and
//! keep the lease alive ([`Registrar`]); clients watch the service prefix and
//! pick from the live set ([`Resolver`]). The coordination store is reached
//! through [`store::CoordinationClient`].

pub mod config;
pub mod endpoint;
pub mod error;
pub mod lease;
pub mod registrar;
pub mod resolver;
pub mod store;

pub use config::{
    DEFAULT_LEASE_TTL, LoadBalancingPolicy, RegistryConfig, ResolverConfig, ServiceConfig,
    StoreBackend,
};
pub use endpoint::{EndpointDescriptor, address_from_key, service_prefix};
pub use error::{RegistryError, Result};
pub use lease::{KeepAliveExit, KeepAliveHandle, LeaseManager};
pub use registrar::{Registrar, RegistrarSettings};
pub use resolver::{EndpointSet, Resolver, ServiceWatch, SyncState};
pub use store::{CoordinationClient, LeaseId, MemoryStore};
