//! Handshake protocol shared by the host and every guest binary.
//!
//! A guest proves it was launched by the host by finding the magic cookie
//! in its environment, then announces its RPC endpoint with exactly one
//! line on standard output:
//!
//! ```text
//! <core version>|<app version>|<network>|<address>|<wire format>
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::PluginError;

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Descriptor compiled into the host and the bundled SDK.
pub const SAMSKIPNAD_PROTOCOL: ProtocolDescriptor =
    ProtocolDescriptor::new(1, "SAMSKIPNAD_PLUGIN", "samskipnad_v1");

// ─── Descriptor ─────────────────────────────────────────────────────────

/// Immutable {version, cookie key, cookie value} triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    protocol_version: u32,
    cookie_key: &'static str,
    cookie_value: &'static str,
}

impl ProtocolDescriptor {
    pub const fn new(
        protocol_version: u32,
        cookie_key: &'static str,
        cookie_value: &'static str,
    ) -> Self {
        Self {
            protocol_version,
            cookie_key,
            cookie_value,
        }
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn cookie_key(&self) -> &'static str {
        self.cookie_key
    }

    pub fn cookie_value(&self) -> &'static str {
        self.cookie_value
    }

    /// Environment pair the host sets on every guest it spawns.
    pub fn cookie_env(&self) -> (&'static str, &'static str) {
        (self.cookie_key, self.cookie_value)
    }

    /// Check a cookie value read from a guest environment.
    pub fn cookie_matches(&self, value: Option<&str>) -> bool {
        value == Some(self.cookie_value)
    }

    /// Guest side: was this process launched by a plugin host?
    pub fn launched_by_host(&self) -> bool {
        let value = std::env::var(self.cookie_key).ok();
        self.cookie_matches(value.as_deref())
    }

    /// Build the handshake a guest listening on `addr` should announce.
    pub fn handshake_for(&self, addr: SocketAddr) -> Handshake {
        Handshake {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: self.protocol_version,
            network: NetworkKind::Tcp,
            address: addr.to_string(),
            wire: WireFormat::Json,
        }
    }

    /// Host side: validate a guest's handshake and return the address to dial.
    pub fn negotiate(&self, handshake: &Handshake) -> Result<SocketAddr, PluginError> {
        if handshake.core_version != CORE_PROTOCOL_VERSION {
            return Err(PluginError::Handshake(format!(
                "unsupported core protocol version {} (host speaks {CORE_PROTOCOL_VERSION})",
                handshake.core_version
            )));
        }
        if handshake.app_version != self.protocol_version {
            return Err(PluginError::Handshake(format!(
                "unsupported plugin protocol version {} (host speaks {})",
                handshake.app_version, self.protocol_version
            )));
        }
        if handshake.network != NetworkKind::Tcp {
            return Err(PluginError::Handshake(format!(
                "unsupported network kind: {}",
                handshake.network
            )));
        }
        if handshake.wire != WireFormat::Json {
            return Err(PluginError::Handshake(format!(
                "unsupported wire format: {}",
                handshake.wire
            )));
        }

        let addr: SocketAddr = handshake.address.parse().map_err(|_| {
            PluginError::Handshake(format!("invalid guest address: {}", handshake.address))
        })?;
        if !addr.ip().is_loopback() {
            return Err(PluginError::Handshake(format!(
                "guest address {addr} is not a loopback address"
            )));
        }
        Ok(addr)
    }
}

// ─── Handshake line ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Tcp,
    Unix,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkKind::Tcp => "tcp",
            NetworkKind::Unix => "unix",
        })
    }
}

impl FromStr for NetworkKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(NetworkKind::Tcp),
            "unix" => Ok(NetworkKind::Unix),
            other => Err(PluginError::Handshake(format!(
                "unknown network kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WireFormat::Json => "json",
        })
    }
}

impl FromStr for WireFormat {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(WireFormat::Json),
            other => Err(PluginError::Handshake(format!(
                "unknown wire format: {other}"
            ))),
        }
    }
}

/// The single line a guest writes to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
    pub network: NetworkKind,
    pub address: String,
    pub wire: WireFormat,
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.wire
        )
    }
}

impl FromStr for Handshake {
    type Err = PluginError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(PluginError::Handshake(format!(
                "malformed handshake line: {line:?}"
            )));
        }

        let parse_version = |field: &str, what: &str| {
            field.parse::<u32>().map_err(|_| {
                PluginError::Handshake(format!("invalid {what} version: {field:?}"))
            })
        };

        if parts[3].is_empty() {
            return Err(PluginError::Handshake("empty guest address".into()));
        }

        Ok(Handshake {
            core_version: parse_version(parts[0], "core protocol")?,
            app_version: parse_version(parts[1], "plugin protocol")?,
            network: parts[2].parse()?,
            address: parts[3].to_string(),
            wire: parts[4].parse()?,
        })
    }
}
