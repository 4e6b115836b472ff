//! Plugin host: spawns guest processes, keeps the registry of live plugins
//! and routes execute calls to them.
//!
//! Every plugin runs in its own OS process and is reached over a loopback
//! RPC connection announced through the handshake line. A guest crash,
//! hang or protocol violation is contained to that one registration: the
//! process is killed, its capability broker closed and its name freed.
//!
//! Registry mutations are short critical sections under a `std` lock that
//! is never held across an await. Loads in flight are tracked as pending
//! reservations so the name and capacity checks see them too; a
//! reservation is released by its drop guard, so a cancelled load cannot
//! leak one.
//!
//! Execute and unload drive the guest from spawned tasks. A caller that
//! drops its future only stops waiting; the round trip or teardown still
//! runs to completion and settles the registration.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use crate::capabilities::{CapabilityBroker, CapabilityGrants, CoreServices, Service};
use crate::config::PluginConfig;
use crate::error::PluginError;
use crate::process::{BoxedReader, ExitReport, ProcessMonitor, ProcessSupervisor, TokioSupervisor};
use crate::protocol::{Handshake, ProtocolDescriptor, SAMSKIPNAD_PROTOCOL};
use crate::value::{Value, ValueMap};
use crate::wire::{method, GuestIdentity, InitializeParams, RpcClient};

/// Longest handshake line accepted from a guest.
const MAX_HANDSHAKE_LINE: u64 = 4096;

/// How often `shutdown` re-checks for registrations still being torn down.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

// ─── Plugin state ───────────────────────────────────────────────────────

/// Lifecycle state of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Spawning,
    Handshaking,
    Ready,
    Executing,
    Unloading,
    Terminated,
    HandshakeFailed,
    Crashed,
    TimedOut,
}

impl PluginState {
    /// Terminal states never leave; the registration is on its way out.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PluginState::Terminated
                | PluginState::HandshakeFailed
                | PluginState::Crashed
                | PluginState::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Spawning => "spawning",
            PluginState::Handshaking => "handshaking",
            PluginState::Ready => "ready",
            PluginState::Executing => "executing",
            PluginState::Unloading => "unloading",
            PluginState::Terminated => "terminated",
            PluginState::HandshakeFailed => "handshake_failed",
            PluginState::Crashed => "crashed",
            PluginState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a registration, for introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub state: PluginState,
    pub pid: Option<u32>,
    pub guest_name: String,
    pub guest_version: String,
    pub services: Vec<Service>,
    pub loaded_at: DateTime<Utc>,
}

// ─── Registration ───────────────────────────────────────────────────────

/// One live plugin: the guest process, its RPC connection and its broker.
struct Registration {
    id: Uuid,
    name: String,
    path: PathBuf,
    identity: GuestIdentity,
    loaded_at: DateTime<Utc>,
    state: Mutex<PluginState>,
    /// Serializes calls to the guest; held for a whole round trip.
    rpc: tokio::sync::Mutex<RpcClient>,
    process: ProcessMonitor,
    broker: CapabilityBroker,
}

impl Registration {
    fn state(&self) -> PluginState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PluginState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move `from -> to`; false if the registration was not in `from`.
    fn transition(&self, from: PluginState, to: PluginState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Claim a live registration (Ready or Executing) for teardown.
    fn claim_live(&self, to: PluginState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, PluginState::Ready | PluginState::Executing) {
            *state = to;
            true
        } else {
            false
        }
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id,
            name: self.name.clone(),
            path: self.path.clone(),
            state: self.state(),
            pid: self.process.pid(),
            guest_name: self.identity.name.clone(),
            guest_version: self.identity.version.clone(),
            services: self.broker.grants().services(),
            loaded_at: self.loaded_at,
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Arc<Registration>>,
    pending: HashSet<String>,
    closed: bool,
}

impl Registry {
    fn live(&self, name: &str) -> Option<&Arc<Registration>> {
        self.active.get(name).filter(|r| !r.state().is_terminal())
    }

    /// Registrations still counted against capacity. Terminal ones are
    /// only waiting for their retirement to finish.
    fn live_count(&self) -> usize {
        self.active.values().filter(|r| !r.state().is_terminal()).count()
    }
}

// ─── Host ───────────────────────────────────────────────────────────────

struct HostInner {
    config: PluginConfig,
    protocol: ProtocolDescriptor,
    supervisor: Arc<dyn ProcessSupervisor>,
    services: CoreServices,
    default_grants: CapabilityGrants,
    registry: RwLock<Registry>,
}

impl HostInner {
    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Registration>, PluginError> {
        self.registry()
            .live(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Remove `registration` if it is still the one registered under its name.
    fn remove(&self, registration: &Arc<Registration>) -> bool {
        let mut registry = self.registry_mut();
        match registry.active.get(&registration.name) {
            Some(current) if Arc::ptr_eq(current, registration) => {
                registry.active.remove(&registration.name);
                true
            }
            _ => false,
        }
    }

    /// Kill the guest, close its broker and drop it from the registry.
    async fn retire(&self, registration: &Arc<Registration>) -> ExitReport {
        let report = registration.process.kill().await;
        registration.broker.close();
        self.remove(registration);
        tracing::debug!(
            plugin = %registration.name,
            state = %registration.state(),
            ?report,
            "plugin retired"
        );
        report
    }

    async fn execute(
        &self,
        registration: Arc<Registration>,
        params: ValueMap,
    ) -> Result<ValueMap, PluginError> {
        let name = registration.name.as_str();
        let timeout_secs = self.config.plugin_timeout_secs;
        let timed_out = || PluginError::ExecutionTimeout {
            name: name.to_string(),
            timeout_secs,
        };

        let Ok(mut rpc) = timeout(self.config.timeout(), registration.rpc.lock()).await else {
            tracing::warn!(plugin = %name, timeout_secs, "gave up waiting for a busy plugin");
            return Err(timed_out());
        };
        if !registration.transition(PluginState::Ready, PluginState::Executing) {
            return Err(PluginError::NotFound(name.to_string()));
        }

        let started = std::time::Instant::now();
        let outcome = timeout(
            self.config.timeout(),
            rpc.call(method::EXECUTE, Value::Map(params)),
        )
        .await;

        // State is settled before the lock is released so a queued caller
        // never observes `Executing`.
        let response = match outcome {
            Err(_) => {
                registration.transition(PluginState::Executing, PluginState::TimedOut);
                drop(rpc);
                tracing::error!(plugin = %name, timeout_secs, "plugin execution timed out, killing process");
                self.retire(&registration).await;
                return Err(timed_out());
            }
            Ok(Err(e)) => {
                registration.transition(PluginState::Executing, PluginState::Crashed);
                drop(rpc);
                tracing::error!(plugin = %name, "plugin connection failed during execute: {e}");
                self.retire(&registration).await;
                return Err(PluginError::Execution(format!("plugin {name} transport failure: {e}")));
            }
            Ok(Ok(response)) => {
                registration.transition(PluginState::Executing, PluginState::Ready);
                drop(rpc);
                response
            }
        };

        tracing::debug!(plugin = %name, elapsed_ms = started.elapsed().as_millis() as u64, "plugin executed");
        match response.into_result() {
            Ok(Value::Map(result)) => Ok(result),
            Ok(_) => Err(PluginError::Execution(format!(
                "plugin {name} returned a non-map result"
            ))),
            Err(msg) => {
                tracing::warn!(plugin = %name, "plugin reported an error: {msg}");
                Err(PluginError::Execution(format!("plugin {name}: {msg}")))
            }
        }
    }

    /// Tear down a registration already claimed as `Unloading`.
    async fn unload(&self, registration: Arc<Registration>) {
        let name = registration.name.as_str();
        let deadline = Instant::now() + self.config.timeout();
        let graceful = timeout_at(deadline, async {
            let mut rpc = registration.rpc.lock().await;
            rpc.call(method::SHUTDOWN, Value::empty_map()).await
        })
        .await;
        match graceful {
            Ok(Ok(response)) => {
                if let Some(msg) = response.error {
                    tracing::warn!(plugin = %name, "plugin reported an error on shutdown: {msg}");
                }
            }
            Ok(Err(e)) => tracing::debug!(plugin = %name, "shutdown request failed: {e}"),
            Err(_) => tracing::warn!(plugin = %name, "plugin did not acknowledge shutdown in time"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let report = match registration.process.wait_for_exit(remaining).await {
            Some(report) => report,
            None => {
                tracing::warn!(plugin = %name, "plugin did not exit in time, killing process");
                registration.process.kill().await
            }
        };

        registration.broker.close();
        registration.set_state(PluginState::Terminated);
        self.remove(&registration);
        tracing::info!(plugin = %name, ?report, "plugin unloaded");
    }
}

/// Name/capacity slot held while a load is in flight.
struct Reservation<'a> {
    inner: &'a HostInner,
    name: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, registration: Arc<Registration>) -> Result<(), PluginError> {
        let mut registry = self.inner.registry_mut();
        registry.pending.remove(&self.name);
        self.committed = true;
        if registry.closed {
            return Err(PluginError::ShuttingDown);
        }
        registry.active.insert(self.name.clone(), registration);
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.registry_mut().pending.remove(&self.name);
        }
    }
}

/// Builder for a `PluginHost` with non-default collaborators.
pub struct PluginHostBuilder {
    config: PluginConfig,
    protocol: ProtocolDescriptor,
    supervisor: Arc<dyn ProcessSupervisor>,
    services: CoreServices,
    default_grants: CapabilityGrants,
}

impl PluginHostBuilder {
    pub fn protocol(mut self, protocol: ProtocolDescriptor) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn supervisor(mut self, supervisor: impl ProcessSupervisor) -> Self {
        self.supervisor = Arc::new(supervisor);
        self
    }

    pub fn services(mut self, services: CoreServices) -> Self {
        self.services = services;
        self
    }

    /// Grants applied by `load_plugin`.
    pub fn default_grants(mut self, grants: CapabilityGrants) -> Self {
        self.default_grants = grants;
        self
    }

    pub fn build(self) -> Result<PluginHost, PluginError> {
        self.config.validate()?;
        tracing::info!(
            plugin_dir = %self.config.plugin_dir.display(),
            max_plugins = self.config.max_plugins,
            timeout_secs = self.config.plugin_timeout_secs,
            services = ?self.services,
            "plugin host created"
        );
        Ok(PluginHost {
            inner: Arc::new(HostInner {
                config: self.config,
                protocol: self.protocol,
                supervisor: self.supervisor,
                services: self.services,
                default_grants: self.default_grants,
                registry: RwLock::new(Registry::default()),
            }),
        })
    }
}

/// Out-of-process plugin host.
///
/// Cheap to clone; every clone drives the same registry.
#[derive(Clone)]
pub struct PluginHost {
    inner: Arc<HostInner>,
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.inner.config)
            .field("plugins", &self.get_loaded_plugins())
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    /// Host with the bundled protocol, the tokio supervisor and no core services.
    pub fn new(config: PluginConfig) -> Result<Self, PluginError> {
        Self::builder(config).build()
    }

    pub fn builder(config: PluginConfig) -> PluginHostBuilder {
        PluginHostBuilder {
            config,
            protocol: SAMSKIPNAD_PROTOCOL,
            supervisor: Arc::new(TokioSupervisor),
            services: CoreServices::new(),
            default_grants: CapabilityGrants::default(),
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    pub fn protocol(&self) -> ProtocolDescriptor {
        self.inner.protocol
    }

    // ── Load ──────────────────────────────────────────────────────────

    /// Spawn the binary at `path`, handshake with it and register it as `name`.
    pub async fn load_plugin(&self, name: &str, path: impl AsRef<Path>) -> Result<(), PluginError> {
        let grants = self.inner.default_grants.clone();
        self.load_plugin_with_grants(name, path, grants).await
    }

    /// Like `load_plugin`, with an explicit capability grant set.
    pub async fn load_plugin_with_grants(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        grants: CapabilityGrants,
    ) -> Result<(), PluginError> {
        let path = path.as_ref();
        let reservation = self.reserve(name)?;
        ensure_executable(path).await?;

        let registration = Arc::new(self.launch(name, path, grants).await?);
        if let Err(e) = reservation.commit(registration.clone()) {
            registration.set_state(PluginState::Terminated);
            self.inner.retire(&registration).await;
            return Err(e);
        }
        self.watch_exit(&registration);

        tracing::info!(
            plugin = %name,
            path = %path.display(),
            pid = ?registration.process.pid(),
            guest = %registration.identity.name,
            version = %registration.identity.version,
            "plugin loaded"
        );
        Ok(())
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, PluginError> {
        let mut registry = self.inner.registry_mut();
        if registry.closed {
            return Err(PluginError::ShuttingDown);
        }
        if registry.live(name).is_some() || registry.pending.contains(name) {
            return Err(PluginError::AlreadyLoaded(name.to_string()));
        }
        let max = self.inner.config.max_plugins;
        if registry.live_count() + registry.pending.len() >= max {
            return Err(PluginError::CapacityExceeded { max });
        }
        registry.pending.insert(name.to_string());
        Ok(Reservation {
            inner: &self.inner,
            name: name.to_string(),
            committed: false,
        })
    }

    async fn launch(
        &self,
        name: &str,
        path: &Path,
        grants: CapabilityGrants,
    ) -> Result<Registration, PluginError> {
        tracing::debug!(plugin = %name, state = %PluginState::Spawning, path = %path.display(), "spawning plugin process");
        let spawned = self
            .inner
            .supervisor
            .spawn(path, &[self.inner.protocol.cookie_env()])
            .await?;
        let process = ProcessMonitor::start(spawned.process, name);
        if let Some(stderr) = spawned.stderr {
            tokio::spawn(forward_guest_output(name.to_string(), "stderr", stderr));
        }

        match self.connect_guest(name, spawned.stdout, grants).await {
            Ok((rpc, broker, identity)) => Ok(Registration {
                id: Uuid::new_v4(),
                name: name.to_string(),
                path: path.to_path_buf(),
                identity,
                loaded_at: Utc::now(),
                state: Mutex::new(PluginState::Ready),
                rpc: tokio::sync::Mutex::new(rpc),
                process,
                broker,
            }),
            Err(e) => {
                tracing::warn!(plugin = %name, state = %PluginState::HandshakeFailed, "plugin failed to start: {e}");
                process.kill().await;
                Err(e)
            }
        }
    }

    /// Read the handshake, dial the guest and initialize it, all within
    /// one plugin timeout.
    async fn connect_guest(
        &self,
        name: &str,
        stdout: BoxedReader,
        grants: CapabilityGrants,
    ) -> Result<(RpcClient, CapabilityBroker, GuestIdentity), PluginError> {
        let secs = self.inner.config.plugin_timeout_secs;
        let deadline = Instant::now() + self.inner.config.timeout();

        tracing::debug!(plugin = %name, state = %PluginState::Handshaking, "waiting for plugin handshake");
        let mut stdout = BufReader::new(stdout);
        let line = timeout_at(deadline, read_handshake_line(&mut stdout))
            .await
            .map_err(|_| PluginError::Handshake(format!("no handshake within {secs}s")))??;
        let handshake: Handshake = line.parse()?;
        let addr = self.inner.protocol.negotiate(&handshake)?;
        tokio::spawn(forward_guest_output(name.to_string(), "stdout", stdout));

        let mut rpc = timeout_at(deadline, RpcClient::connect(addr))
            .await
            .map_err(|_| PluginError::Handshake(format!("timed out connecting to guest at {addr}")))?
            .map_err(|e| PluginError::Handshake(format!("cannot connect to guest at {addr}: {e}")))?;

        let broker = CapabilityBroker::bind_with_auth_timeout(
            name,
            self.inner.services.clone(),
            grants,
            self.inner.config.timeout(),
        )
        .await?;
        let params = Value::from_serialize(&InitializeParams {
            capabilities: broker.offer(),
        })?;
        let response = timeout_at(deadline, rpc.call(method::INITIALIZE, params))
            .await
            .map_err(|_| {
                PluginError::Initialization(format!("plugin {name} did not initialize within {secs}s"))
            })?
            .map_err(|e| PluginError::Initialization(format!("transport failure during initialize: {e}")))?;
        let identity: GuestIdentity = response
            .into_result()
            .map_err(PluginError::Initialization)?
            .deserialize_into()
            .map_err(|e| PluginError::Initialization(format!("malformed initialize reply: {e}")))?;

        Ok((rpc, broker, identity))
    }

    /// Mark the registration crashed when its process exits on its own.
    fn watch_exit(&self, registration: &Arc<Registration>) {
        let mut exit_rx = registration.process.subscribe();
        let registration = Arc::downgrade(registration);
        let inner: Weak<HostInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let report = exit_rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|r| r.clone());
            let Some(registration) = registration.upgrade() else {
                return;
            };
            if registration.claim_live(PluginState::Crashed) {
                tracing::warn!(plugin = %registration.name, ?report, "plugin process exited unexpectedly");
                registration.broker.close();
                if let Some(inner) = inner.upgrade() {
                    inner.remove(&registration);
                }
            }
        });
    }

    // ── Execute ───────────────────────────────────────────────────────

    /// Send `params` to the plugin and return its result map.
    ///
    /// Calls to one plugin are serialized. A call that exceeds the plugin
    /// timeout kills the plugin; a guest-reported error leaves it loaded.
    /// Waiting behind another call is bounded by the same timeout.
    pub async fn execute_plugin(&self, name: &str, params: ValueMap) -> Result<ValueMap, PluginError> {
        let registration = self.inner.lookup(name)?;
        let inner = self.inner.clone();
        // The round trip runs detached: a caller that goes away must not
        // leave the registration mid-call.
        tokio::spawn(async move { inner.execute(registration, params).await })
            .await
            .map_err(|e| task_failed(name, "execute", e))?
    }

    // ── Unload ────────────────────────────────────────────────────────

    /// Ask the plugin to shut down, kill it if it does not exit in time,
    /// and free its name.
    pub async fn unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        let registration = self.inner.lookup(name)?;
        if !registration.claim_live(PluginState::Unloading) {
            return Err(PluginError::NotFound(name.to_string()));
        }
        tracing::debug!(plugin = %name, "unloading plugin");

        // Once claimed, teardown finishes even if the caller is dropped.
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.unload(registration).await })
            .await
            .map_err(|e| task_failed(name, "unload", e))
    }

    // ── Introspection ─────────────────────────────────────────────────

    /// Names of all live plugins, sorted.
    pub fn get_loaded_plugins(&self) -> Vec<String> {
        let registry = self.inner.registry();
        let mut names: Vec<String> = registry
            .active
            .iter()
            .filter(|(_, r)| !r.state().is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn plugin_info(&self, name: &str) -> Option<PluginInfo> {
        self.inner.registry().live(name).map(|r| r.info())
    }

    /// Snapshots of all live plugins, sorted by name.
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        let registry = self.inner.registry();
        let mut plugins: Vec<PluginInfo> = registry
            .active
            .values()
            .filter(|r| !r.state().is_terminal())
            .map(|r| r.info())
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }

    // ── Shutdown ──────────────────────────────────────────────────────

    /// Unload every plugin concurrently and refuse new loads.
    ///
    /// Returns once no registration or in-flight load remains.
    pub async fn shutdown(&self) {
        let count = {
            let mut registry = self.inner.registry_mut();
            registry.closed = true;
            registry.active.len() + registry.pending.len()
        };
        tracing::info!(count, "shutting down plugin host");

        loop {
            let (names, pending) = {
                let registry = self.inner.registry();
                let names: Vec<String> = registry.active.keys().cloned().collect();
                (names, registry.pending.len())
            };
            if names.is_empty() && pending == 0 {
                break;
            }

            let mut unloads = JoinSet::new();
            for name in names {
                let host = self.clone();
                unloads.spawn(async move {
                    let result = host.unload_plugin(&name).await;
                    (name, result)
                });
            }
            while let Some(joined) = unloads.join_next().await {
                match joined {
                    // Someone else is already tearing it down.
                    Ok((_, Err(PluginError::NotFound(_)))) | Ok((_, Ok(()))) => {}
                    Ok((name, Err(e))) => {
                        tracing::warn!(plugin = %name, "failed to unload plugin during shutdown: {e}")
                    }
                    Err(e) => tracing::error!("plugin unload task failed: {e}"),
                }
            }

            let settled = {
                let registry = self.inner.registry();
                registry.active.is_empty() && registry.pending.is_empty()
            };
            if !settled {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        }
        tracing::info!("plugin host shut down");
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn task_failed(name: &str, operation: &str, e: tokio::task::JoinError) -> PluginError {
    tracing::error!(plugin = %name, operation, "plugin task failed: {e}");
    PluginError::Execution(format!("plugin {name} {operation} task failed: {e}"))
}

async fn ensure_executable(path: &Path) -> Result<(), PluginError> {
    let missing = || PluginError::BinaryMissing(path.to_path_buf());
    let metadata = tokio::fs::metadata(path).await.map_err(|_| missing())?;
    if !metadata.is_file() {
        return Err(missing());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(missing());
        }
    }
    Ok(())
}

async fn read_handshake_line<R>(reader: &mut R) -> Result<String, PluginError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader
        .take(MAX_HANDSHAKE_LINE)
        .read_line(&mut line)
        .await
        .map_err(|e| PluginError::Handshake(format!("failed to read handshake: {e}")))?;

    if read == 0 {
        return Err(PluginError::Handshake(
            "plugin closed stdout before completing the handshake".into(),
        ));
    }
    if !line.ends_with('\n') && read as u64 >= MAX_HANDSHAKE_LINE {
        return Err(PluginError::Handshake("handshake line too long".into()));
    }
    Ok(line)
}

/// Relay a guest's output stream into the host log until it closes.
async fn forward_guest_output<R>(plugin: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stream == "stderr" => {
                tracing::info!(target: "samskipnad_plugin::guest", plugin = %plugin, "{line}")
            }
            Ok(Some(line)) => {
                tracing::warn!(target: "samskipnad_plugin::guest", plugin = %plugin, stream, "unexpected output: {line}")
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(plugin = %plugin, stream, "stopped reading guest output: {e}");
                break;
            }
        }
    }
}
