//! Plugin host configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Upper bound for `plugin_timeout_secs` (one day).
pub const MAX_PLUGIN_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Configuration supplied once at host construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directory plugins are installed in (informational; no discovery).
    pub plugin_dir: PathBuf,
    /// Maximum number of live plugins (default: 10).
    pub max_plugins: usize,
    /// Bound for handshake, execute and unload, in seconds (default: 30).
    pub plugin_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            max_plugins: 10,
            plugin_timeout_secs: 30,
        }
    }
}

impl PluginConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup, falling back to defaults
    /// for missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            plugin_dir: lookup("PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_dir),
            max_plugins: lookup("PLUGIN_MAX")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_plugins),
            plugin_timeout_secs: lookup("PLUGIN_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.plugin_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.max_plugins < 1 {
            return Err(PluginError::InvalidConfig(
                "max_plugins must be at least 1".into(),
            ));
        }
        if self.plugin_timeout_secs == 0 {
            return Err(PluginError::InvalidConfig(
                "plugin_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.plugin_timeout_secs > MAX_PLUGIN_TIMEOUT_SECS {
            return Err(PluginError::InvalidConfig(format!(
                "plugin_timeout_secs must be at most {MAX_PLUGIN_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }
}
