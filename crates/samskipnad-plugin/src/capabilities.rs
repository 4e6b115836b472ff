//! Core-service capabilities granted to plugins.
//!
//! Each loaded plugin gets its own `CapabilityBroker`: a loopback RPC
//! endpoint that forwards `<service>.<method>` calls to the host's core
//! services, but only for the services the plugin was granted. The guest
//! learns the broker address and a one-time token through the
//! `CapabilityOffer` sent with `plugin.initialize`. Nothing else of the
//! host (database handles, process tables) is reachable from a guest.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::error::PluginError;
use crate::value::Value;
use crate::wire::{method, read_frame, write_frame, Request, Response};

// ─── Services ───────────────────────────────────────────────────────────

/// Core services a plugin may be granted access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    UserProfile,
    CommunityManagement,
    ItemManagement,
    Payment,
    EventBus,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::UserProfile,
        Service::CommunityManagement,
        Service::ItemManagement,
        Service::Payment,
        Service::EventBus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UserProfile => "user_profile",
            Service::CommunityManagement => "community_management",
            Service::ItemManagement => "item_management",
            Service::Payment => "payment",
            Service::EventBus => "event_bus",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|svc| svc.as_str() == s)
            .ok_or_else(|| PluginError::Capability(format!("unknown service: {s}")))
    }
}

/// A single capability invocation, attributed to the calling plugin.
#[derive(Debug, Clone)]
pub struct ServiceCall<'a> {
    pub plugin: &'a str,
    pub method: &'a str,
    pub params: Value,
}

/// A host core service reachable from plugins.
#[async_trait]
pub trait CoreService: Send + Sync {
    async fn call(&self, call: ServiceCall<'_>) -> Result<Value, PluginError>;
}

/// The host's live core-service connections.
#[derive(Clone, Default)]
pub struct CoreServices {
    services: HashMap<Service, Arc<dyn CoreService>>,
}

impl CoreServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: Service, backend: Arc<dyn CoreService>) -> Self {
        self.services.insert(service, backend);
        self
    }

    pub fn get(&self, service: Service) -> Option<Arc<dyn CoreService>> {
        self.services.get(&service).cloned()
    }
}

impl fmt::Debug for CoreServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wired: Vec<&Service> = self.services.keys().collect();
        wired.sort();
        f.debug_struct("CoreServices").field("wired", &wired).finish()
    }
}

// ─── Grants ─────────────────────────────────────────────────────────────

/// The set of services a particular plugin may call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrants(BTreeSet<Service>);

impl CapabilityGrants {
    pub fn all() -> Self {
        Self(Service::ALL.into_iter().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn only(services: impl IntoIterator<Item = Service>) -> Self {
        Self(services.into_iter().collect())
    }

    pub fn allows(&self, service: Service) -> bool {
        self.0.contains(&service)
    }

    pub fn services(&self) -> Vec<Service> {
        self.0.iter().copied().collect()
    }
}

impl Default for CapabilityGrants {
    fn default() -> Self {
        Self::all()
    }
}

/// What a guest receives at initialization to build its client handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOffer {
    pub plugin: String,
    pub broker: SocketAddr,
    pub token: String,
    pub services: Vec<Service>,
}

// ─── Broker ─────────────────────────────────────────────────────────────

struct BrokerContext {
    plugin: String,
    token: String,
    services: CoreServices,
    grants: CapabilityGrants,
    auth_timeout: Duration,
}

impl BrokerContext {
    async fn dispatch(&self, request: Request) -> Response {
        match self.route(request).await {
            Ok(value) => Response::ok(value),
            Err(e) => {
                tracing::debug!(plugin = %self.plugin, "capability call rejected: {e}");
                Response::err(e.guest_message())
            }
        }
    }

    async fn route(&self, request: Request) -> Result<Value, PluginError> {
        let (service, method) = request.method.split_once('.').ok_or_else(|| {
            PluginError::Capability(format!("malformed capability method: {}", request.method))
        })?;
        let service: Service = service.parse()?;

        if !self.grants.allows(service) {
            return Err(PluginError::PermissionDenied(format!(
                "plugin '{}' was not granted the {service} capability",
                self.plugin
            )));
        }

        let backend = self
            .services
            .get(service)
            .ok_or_else(|| PluginError::Capability(format!("{service} service unavailable")))?;

        backend
            .call(ServiceCall {
                plugin: &self.plugin,
                method,
                params: request.params,
            })
            .await
    }
}

/// Per-plugin capability endpoint. Closing it invalidates the guest's
/// handles; it is also closed on drop.
pub struct CapabilityBroker {
    addr: SocketAddr,
    ctx: Arc<BrokerContext>,
    task: JoinHandle<()>,
}

impl fmt::Debug for CapabilityBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityBroker")
            .field("plugin", &self.ctx.plugin)
            .field("addr", &self.addr)
            .field("grants", &self.ctx.grants)
            .finish_non_exhaustive()
    }
}

/// How long a fresh broker connection may take to authenticate.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

impl CapabilityBroker {
    pub async fn bind(
        plugin: &str,
        services: CoreServices,
        grants: CapabilityGrants,
    ) -> Result<Self, PluginError> {
        Self::bind_with_auth_timeout(plugin, services, grants, DEFAULT_AUTH_TIMEOUT).await
    }

    /// Like `bind`; connections that do not authenticate within
    /// `auth_timeout` are dropped.
    pub async fn bind_with_auth_timeout(
        plugin: &str,
        services: CoreServices,
        grants: CapabilityGrants,
        auth_timeout: Duration,
    ) -> Result<Self, PluginError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let ctx = Arc::new(BrokerContext {
            plugin: plugin.to_string(),
            token: Uuid::new_v4().to_string(),
            services,
            grants,
            auth_timeout,
        });

        let task = tokio::spawn(accept_loop(listener, ctx.clone()));
        tracing::debug!(plugin = %plugin, %addr, "capability broker listening");

        Ok(Self { addr, ctx, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn grants(&self) -> &CapabilityGrants {
        &self.ctx.grants
    }

    pub fn offer(&self) -> CapabilityOffer {
        CapabilityOffer {
            plugin: self.ctx.plugin.clone(),
            broker: self.addr,
            token: self.ctx.token.clone(),
            services: self.ctx.grants.services(),
        }
    }

    /// Stop accepting calls and drop every open guest connection.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for CapabilityBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<BrokerContext>) {
    // Dropping the set (when this task is aborted) aborts every connection.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !peer.ip().is_loopback() {
                        tracing::warn!(plugin = %ctx.plugin, %peer, "refusing non-loopback broker connection");
                        continue;
                    }
                    connections.spawn(serve_connection(stream, ctx.clone()));
                }
                Err(e) => {
                    tracing::warn!(plugin = %ctx.plugin, "broker accept failed: {e}");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(mut stream: TcpStream, ctx: Arc<BrokerContext>) {
    let first = tokio::time::timeout(ctx.auth_timeout, read_frame::<_, Request>(&mut stream)).await;
    let authenticated = match first {
        Ok(Ok(Some(req))) => {
            req.method == method::AUTHENTICATE
                && req.params.get("token").and_then(Value::as_str) == Some(ctx.token.as_str())
        }
        Err(_) => {
            tracing::warn!(plugin = %ctx.plugin, "broker connection did not authenticate in time");
            return;
        }
        _ => return,
    };

    if !authenticated {
        tracing::warn!(plugin = %ctx.plugin, "broker connection failed authentication");
        let _ = write_frame(&mut stream, &Response::err("authentication failed")).await;
        return;
    }
    if write_frame(&mut stream, &Response::ok(Value::empty_map()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        let request = match read_frame::<_, Request>(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(plugin = %ctx.plugin, "broker connection error: {e}");
                break;
            }
        };

        let response = ctx.dispatch(request).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            tracing::debug!(plugin = %ctx.plugin, "broker write failed: {e}");
            break;
        }
    }
}
