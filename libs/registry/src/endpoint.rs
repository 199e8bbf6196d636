//! Endpoint descriptor and registry key codec.
//!
//! Keys are laid out as `<service_name>/<address>` or
//! `<service_name>/<version>/<address>` when a version is set. The address is
//! always the last segment, so a delete event can be mapped back to an address
//! without looking at the (already removed) value.

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

const KEY_SEPARATOR: char = '/';

fn default_weight() -> u32 {
    1
}

/// One network-reachable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(alias = "name")]
    pub service_name: String,
    #[serde(alias = "addr")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl EndpointDescriptor {
    /// Create a descriptor for `service_name` reachable at `address` (`host:port`).
    ///
    /// # Errors
    /// Returns [`RegistryError::Config`] if the name or the address is malformed.
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let descriptor = Self {
            service_name: service_name.into(),
            address: address.into(),
            version: None,
            weight: default_weight(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Set the version segment. Empty strings clear it.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.version = if version.is_empty() {
            None
        } else {
            Some(version)
        };
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Check every field that ends up in the registry key.
    ///
    /// # Errors
    /// Returns [`RegistryError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        validate_service_name(&self.service_name)?;
        validate_address(&self.address)?;
        if let Some(version) = &self.version {
            validate_segment("service version", version)?;
        }
        if self.weight == 0 {
            return Err(RegistryError::Config(format!(
                "endpoint weight for '{}' must be at least 1",
                self.address
            )));
        }
        Ok(())
    }

    /// The registry key this descriptor is stored under.
    #[must_use]
    pub fn registry_key(&self) -> String {
        match &self.version {
            Some(version) => format!("{}/{version}/{}", self.service_name, self.address),
            None => format!("{}/{}", self.service_name, self.address),
        }
    }

    /// JSON value written to the store.
    ///
    /// # Errors
    /// Returns [`RegistryError::Codec`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a stored value.
    ///
    /// # Errors
    /// Returns [`RegistryError::Codec`] if the bytes are not a descriptor.
    pub fn decode(value: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(value)?)
    }
}

/// Prefix watched by resolvers of `service_name`.
#[must_use]
pub fn service_prefix(service_name: &str) -> String {
    format!("{service_name}{KEY_SEPARATOR}")
}

/// Prefix narrowed to one version of `service_name`.
#[must_use]
pub fn version_prefix(service_name: &str, version: &str) -> String {
    format!("{service_name}{KEY_SEPARATOR}{version}{KEY_SEPARATOR}")
}

/// Last segment of a registry key.
#[must_use]
pub fn address_from_key(key: &str) -> Option<&str> {
    key.rsplit_once(KEY_SEPARATOR)
        .map(|(_, addr)| addr)
        .filter(|addr| !addr.is_empty())
}

/// Rebuild a minimal descriptor from its key when the stored value is unreadable.
#[must_use]
pub fn descriptor_from_key(key: &str) -> Option<EndpointDescriptor> {
    let mut segments = key.split(KEY_SEPARATOR);
    let service_name = segments.next()?.to_owned();
    let rest: Vec<&str> = segments.collect();
    let (version, address) = match rest.as_slice() {
        [address] => (None, *address),
        [version, address] => (Some((*version).to_owned()), *address),
        _ => return None,
    };
    let descriptor = EndpointDescriptor {
        service_name,
        address: address.to_owned(),
        version,
        weight: default_weight(),
    };
    descriptor.validate().ok().map(|()| descriptor)
}

/// # Errors
/// Returns [`RegistryError::Config`] if the name is empty or contains `/`.
pub fn validate_service_name(name: &str) -> Result<()> {
    validate_segment("service name", name)
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RegistryError::Config(format!("{what} must not be empty")));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(RegistryError::Config(format!(
            "{what} '{value}' must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<()> {
    validate_segment("service address", address)?;
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(RegistryError::Config(format!(
            "service address '{address}' must be host:port"
        )));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(RegistryError::Config(format!(
            "service address '{address}' must be host:port"
        )));
    }
    Ok(())
}
