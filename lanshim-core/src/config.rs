//! Configuration source.
//!
//! The topology is described by environment-style `SHIM_*` keys, read from an
//! env file and/or the process environment. Nothing here interprets the
//! values; [`crate::topology`] validates them.

use crate::error::{Result, ShimError};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Configuration keys.
pub mod keys {
    /// Prefix shared by every key.
    pub const PREFIX: &str = "SHIM_";
    pub const HOST_INTERFACE: &str = "SHIM_HOST_INTERFACE";
    pub const SUBNET: &str = "SHIM_SUBNET";
    pub const GATEWAY: &str = "SHIM_GATEWAY";
    pub const SERVICE_RANGE: &str = "SHIM_SERVICE_RANGE";
    pub const INTERFACE_NAME: &str = "SHIM_INTERFACE_NAME";
    pub const HOST_ENDPOINT: &str = "SHIM_HOST_ENDPOINT";
    pub const UNIT_NAME: &str = "SHIM_UNIT_NAME";
    /// Service addresses are `SHIM_SERVICE_<NAME>_ADDR`.
    pub const SERVICE_PREFIX: &str = "SHIM_SERVICE_";
    pub const SERVICE_SUFFIX: &str = "_ADDR";

    /// Key holding the address of service `name`.
    pub fn service(name: &str) -> String {
        format!("{}{}{}", SERVICE_PREFIX, name.replace('-', "_").to_ascii_uppercase(), SERVICE_SUFFIX)
    }
}

/// Raw key/value configuration, not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    values: BTreeMap<String, String>,
}

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `KEY=VALUE` pairs from an env file.
    pub fn from_env_file(path: &Path) -> Result<Self> {
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            ShimError::validation("env-file", format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut config = Self::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                ShimError::validation("env-file", format!("{}: {}", path.display(), e))
            })?;
            config.set(key, value);
        }
        debug!(path = %path.display(), keys = config.values.len(), "Loaded env file");
        Ok(config)
    }

    /// Collect `SHIM_*` variables from the process environment.
    pub fn from_process_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Collect `SHIM_*` pairs from any iterator.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Self::new();
        for (key, value) in pairs {
            let key = key.into();
            if key.starts_with(keys::PREFIX) {
                config.set(key, value);
            }
        }
        config
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merge(mut self, other: RawConfig) -> Self {
        self.values.extend(other.values);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Value of `key`, trimmed; blank values count as missing.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Value of a key that must be present.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| ShimError::validation(key, "required key is missing"))
    }

    /// Service entries as `(key, name, value)`, in key order.
    pub fn services(&self) -> impl Iterator<Item = (&str, String, &str)> + '_ {
        self.values.iter().filter_map(|(key, value)| {
            let name = key
                .strip_prefix(keys::SERVICE_PREFIX)?
                .strip_suffix(keys::SERVICE_SUFFIX)?;
            Some((key.as_str(), name.to_ascii_lowercase().replace('_', "-"), value.trim()))
        })
    }

    /// Render as an env file.
    pub fn to_env_string(&self) -> String {
        self.values.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect()
    }
}
