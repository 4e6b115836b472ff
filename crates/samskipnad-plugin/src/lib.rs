//! Samskipnad out-of-process plugin system.
//!
//! Third-party extensions run as separate executables. The [`PluginHost`]
//! launches each one as a child process, verifies it through a versioned
//! handshake, offers it a restricted set of core-service capabilities and
//! brokers request/response calls to it. A misbehaving plugin (crash, hang,
//! protocol garbage) is killed and unregistered without affecting the host
//! or any other plugin.
//!
//! The [`sdk`] module is the guest half: plugin binaries implement
//! [`sdk::GuestPlugin`] and call [`sdk::run`].

pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod process;
pub mod protocol;
pub mod sdk;
pub mod value;
pub mod wire;

pub use capabilities::{CapabilityGrants, CoreService, CoreServices, Service, ServiceCall};
pub use config::PluginConfig;
pub use error::PluginError;
pub use events::{EventBus, PluginEvent};
pub use host::{PluginHost, PluginHostBuilder, PluginInfo, PluginState};
pub use protocol::{ProtocolDescriptor, SAMSKIPNAD_PROTOCOL};
pub use value::{Value, ValueMap};
