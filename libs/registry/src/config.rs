//! Typed configuration for the coordination store, registrar and resolver.
//!
//! Every section deserializes with defaults so a partial YAML/env layer is
//! enough; validation happens explicitly through `validate()` at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Lease TTL applied when zero is configured.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

/// Which coordination store implementation backs the client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store; endpoints are only visible inside this process.
    #[default]
    Memory,
    /// etcd v3 (requires the `etcd` feature).
    Etcd,
}

/// Coordination store connection and lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    pub backend: StoreBackend,
    /// Store endpoints, e.g. `["127.0.0.1:2379"]`.
    pub endpoints: Vec<String>,
    pub dial_timeout_ms: u64,
    /// Deadline for every individual store call (grant, put, delete, read).
    pub request_timeout_ms: u64,
    /// Zero means [`DEFAULT_LEASE_TTL`].
    pub lease_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: vec!["127.0.0.1:2379".to_owned()],
            dial_timeout_ms: 5_000,
            request_timeout_ms: 3_000,
            lease_ttl_secs: DEFAULT_LEASE_TTL.as_secs(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        effective_ttl(Duration::from_secs(self.lease_ttl_secs))
    }

    /// # Errors
    /// Returns [`RegistryError::Config`] for zero timeouts or a networked backend
    /// without endpoints.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(RegistryError::Config(
                "registry.request_timeout_ms must be greater than zero".to_owned(),
            ));
        }
        if self.backend == StoreBackend::Etcd {
            if self.endpoints.iter().all(|e| e.trim().is_empty()) {
                return Err(RegistryError::Config(
                    "registry.endpoints must list at least one store address".to_owned(),
                ));
            }
            if self.dial_timeout_ms == 0 {
                return Err(RegistryError::Config(
                    "registry.dial_timeout_ms must be greater than zero".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

/// Replace a zero TTL with [`DEFAULT_LEASE_TTL`] and round sub-second values up.
#[must_use]
pub fn effective_ttl(ttl: Duration) -> Duration {
    if ttl.is_zero() {
        DEFAULT_LEASE_TTL
    } else if ttl < Duration::from_secs(1) {
        Duration::from_secs(1)
    } else {
        ttl
    }
}

/// Identity of the service instance this process advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Address advertised in the registry (`host:port`).
    pub address: String,
    pub version: String,
    pub weight: Option<u32>,
    /// Bind address when it differs from the advertised one (e.g. `0.0.0.0:9000`).
    pub listen_addr: Option<String>,
}

/// Load-balancing policy applied by [`crate::resolver::ServiceWatch::pick`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
}

/// Resolver (watch loop) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    pub policy: LoadBalancingPolicy,
    /// Restrict discovery to one version partition of the service.
    pub version: Option<String>,
    pub request_timeout_ms: u64,
    pub resync_backoff_ms: u64,
    pub max_resync_backoff_ms: u64,
    /// Consecutive failed resynchronisations before the set is reported degraded.
    pub max_resync_failures: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            policy: LoadBalancingPolicy::default(),
            version: None,
            request_timeout_ms: 3_000,
            resync_backoff_ms: 100,
            max_resync_backoff_ms: 5_000,
            max_resync_failures: 3,
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff before resync attempt number `attempt` (1-based), capped.
    #[must_use]
    pub fn resync_backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.resync_backoff_ms);
        let max = Duration::from_millis(self.max_resync_backoff_ms);
        base.saturating_mul(attempt.max(1)).min(max)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_falls_back_to_default() {
        let cfg = RegistryConfig {
            lease_ttl_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.lease_ttl(), DEFAULT_LEASE_TTL);
        assert_eq!(effective_ttl(Duration::from_millis(10)), Duration::from_secs(1));
        assert_eq!(effective_ttl(Duration::from_secs(8)), Duration::from_secs(8));
    }

    #[test]
    fn etcd_backend_requires_endpoints() {
        let cfg = RegistryConfig {
            backend: StoreBackend::Etcd,
            endpoints: vec![],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RegistryError::Config(_))));

        let memory = RegistryConfig {
            endpoints: vec![],
            ..Default::default()
        };
        assert!(memory.validate().is_ok());
    }

    #[test]
    fn deserializes_partial_sections() {
        let cfg: RegistryConfig =
            serde_json::from_value(serde_json::json!({ "backend": "etcd", "lease_ttl_secs": 10 }))
                .unwrap();
        assert_eq!(cfg.backend, StoreBackend::Etcd);
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(10));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(3));

        let bad = serde_json::from_value::<RegistryConfig>(serde_json::json!({ "ttl": 10 }));
        assert!(bad.is_err(), "unknown fields are rejected");
    }

    #[test]
    fn resync_backoff_is_capped() {
        let cfg = ResolverConfig {
            resync_backoff_ms: 100,
            max_resync_backoff_ms: 250,
            ..Default::default()
        };
        assert_eq!(cfg.resync_backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.resync_backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.resync_backoff(10), Duration::from_millis(250));
    }
}
