//! Layered node configuration: defaults, then an optional YAML file, then
//! `REGISTRY__*` environment variables, then CLI overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use registry::{RegistryConfig, ResolverConfig, ServiceConfig};
use registry_transport_grpc::ServerSettings;
use serde::{Deserialize, Serialize};

/// Environment prefix; nested keys are separated by `__`,
/// e.g. `REGISTRY__STORE__LEASE_TTL_SECS=10`.
pub const ENV_PREFIX: &str = "REGISTRY__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when neither `-v` nor `RUST_LOG` is given.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub store: RegistryConfig,
    pub service: ServiceConfig,
    pub resolver: ResolverConfig,
    pub logging: LoggingConfig,
    /// Upper bound on draining in-flight RPCs at shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            store: RegistryConfig::default(),
            service: ServiceConfig {
                name: "ping".to_owned(),
                address: "127.0.0.1:0".to_owned(),
                version: "v1".to_owned(),
                weight: None,
                listen_addr: None,
            },
            resolver: ResolverConfig::default(),
            logging: LoggingConfig::default(),
            drain_timeout_ms: 10_000,
        }
    }
}

impl NodeConfig {
    /// Load defaults, merge `path` (if any), then the environment.
    ///
    /// # Errors
    /// Returns an error if the file is missing or any layer fails to deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                anyhow::bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load configuration")
    }

    /// # Errors
    /// Returns the first invalid section.
    pub fn validate(&self) -> Result<()> {
        self.store.validate().context("invalid store section")?;
        ServerSettings::from(&self.service)
            .validate()
            .context("invalid service section")?;
        if self.resolver.request_timeout_ms == 0 {
            anyhow::bail!("resolver.request_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Settings for the served instance.
    #[must_use]
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            drain_timeout: self.drain_timeout(),
            ..ServerSettings::from(&self.service)
        }
    }

    /// # Errors
    /// Returns an error if the config cannot be serialized.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to render configuration")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use figment::Jail;
    use registry::StoreBackend;

    #[test]
    fn defaults_are_valid() {
        let cfg = NodeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.server_settings().service_name, "ping");
        assert_eq!(cfg.server_settings().drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn yaml_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "node.yaml",
                r"
store:
  backend: etcd
  endpoints: ['10.0.0.5:2379']
  lease_ttl_secs: 10
service:
  name: orders
  address: 10.0.0.1:9000
  version: v2
logging:
  format: json
",
            )?;
            jail.set_env("REGISTRY__STORE__LEASE_TTL_SECS", "15");
            jail.set_env("REGISTRY__RESOLVER__POLICY", "weighted_round_robin");

            let cfg = NodeConfig::load(Some(Path::new("node.yaml"))).unwrap();
            assert_eq!(cfg.store.backend, StoreBackend::Etcd);
            assert_eq!(cfg.store.endpoints, vec!["10.0.0.5:2379".to_owned()]);
            assert_eq!(cfg.store.lease_ttl_secs, 15);
            assert_eq!(cfg.service.name, "orders");
            assert_eq!(cfg.service.version, "v2");
            assert_eq!(
                cfg.resolver.policy,
                registry::LoadBalancingPolicy::WeightedRoundRobin
            );
            assert_eq!(cfg.logging.format, LogFormat::Json);
            assert_eq!(cfg.logging.level, "info");
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = NodeConfig::load(Some(Path::new("/nonexistent/node.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("node.yaml", "store:\n  ttl: 3\n")?;
            assert!(NodeConfig::load(Some(Path::new("node.yaml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn empty_service_name_fails_validation() {
        let mut cfg = NodeConfig::default();
        cfg.service.name.clear();
        assert!(cfg.validate().is_err());
    }
}
