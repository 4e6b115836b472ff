//! Guest-side SDK for writing plugin binaries.
//!
//! A plugin implements [`GuestPlugin`] (usually by embedding a
//! [`BasePlugin`] and overriding `execute`) and hands itself to [`run`]:
//!
//! ```no_run
//! use samskipnad_plugin::sdk::{self, BasePlugin};
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     sdk::run(BasePlugin::new("hello", "0.1.0")).await
//! }
//! ```

mod capabilities;
mod serve;

use async_trait::async_trait;

use crate::error::PluginError;
use crate::value::ValueMap;

pub use capabilities::{CapabilitySet, ServiceClient};
pub use serve::{init_logging, run, serve};

/// The lifecycle every guest plugin exposes to the host.
///
/// All methods have defaults built on [`BasePlugin`]; a plugin only has to
/// point `base`/`base_mut` at its embedded base.
#[async_trait]
pub trait GuestPlugin: Send {
    fn base(&self) -> &BasePlugin;

    fn base_mut(&mut self) -> &mut BasePlugin;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn version(&self) -> &str {
        self.base().version()
    }

    /// Store the capability handles granted by the host.
    async fn initialize(&mut self, capabilities: CapabilitySet) -> Result<(), PluginError> {
        let base = self.base_mut();
        tracing::info!(
            plugin = %base.name,
            version = %base.version,
            services = ?capabilities.granted(),
            "plugin initialized"
        );
        base.capabilities = capabilities;
        Ok(())
    }

    async fn execute(&mut self, _params: ValueMap) -> Result<ValueMap, PluginError> {
        Ok(self.base().success_reply())
    }

    /// Release capability handles. Called at most once.
    async fn shutdown(&mut self) -> Result<(), PluginError> {
        let base = self.base_mut();
        tracing::info!(plugin = %base.name, "plugin shutting down");
        base.capabilities = CapabilitySet::default();
        Ok(())
    }
}

/// Name, version and capability handles shared by every plugin.
#[derive(Debug)]
pub struct BasePlugin {
    name: String,
    version: String,
    capabilities: CapabilitySet,
}

impl BasePlugin {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: CapabilitySet::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Handles granted at initialization; empty before and after.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// The reply of a plugin that does not override `execute`.
    pub fn success_reply(&self) -> ValueMap {
        let mut reply = ValueMap::new();
        reply.insert("status".into(), "success".into());
        reply.insert("message".into(), "Base plugin executed successfully".into());
        reply.insert("plugin".into(), self.name.as_str().into());
        reply.insert("version".into(), self.version.as_str().into());
        reply
    }
}

impl GuestPlugin for BasePlugin {
    fn base(&self) -> &BasePlugin {
        self
    }

    fn base_mut(&mut self) -> &mut BasePlugin {
        self
    }
}
