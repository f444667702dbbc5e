//! Per-tenant gateway supervision
//!
//! A [`TenantSupervisor`] answers one question for the proxy: which process
//! serves this tenant right now? It finds or launches the gateway, waits for
//! it to become ready and caches the answer until the proxy reports the
//! process unreachable.
//!
//! Startup is single-flight. The first caller spawns the startup pipeline as
//! its own task and stores a shared handle to it in the slot; every other
//! caller awaits the same handle. The task writes its own outcome back, so
//! the work finishes even when every waiting client has gone away. Each
//! attempt carries a generation number and only the current generation may
//! write to the slot.

use crate::config::{GatewayConfig, ProviderCredentials};
use crate::error::StartupError;
use crate::launcher::{self, GatewayToken, LaunchCommand};
use crate::locator;
use crate::readiness::{self, ReadinessProbe};
use crate::sandbox::{BackendProcess, Sandbox, SandboxProvider};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Where a tenant's gateway is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Unknown,
    Probing,
    LaunchPending,
    WaitingReady,
    Ready,
    Failed,
}

/// Everything a supervisor needs to launch and check gateways
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub command: LaunchCommand,
    pub signatures: Vec<String>,
    pub token_prefix: String,
    /// Budget for an already running gateway before it counts as stale
    pub stale_grace: Duration,
    /// Budget for a freshly launched gateway
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub providers: ProviderCredentials,
}

impl GatewaySettings {
    pub fn from_config(gateway: &GatewayConfig, providers: ProviderCredentials) -> Self {
        Self {
            command: LaunchCommand {
                program: gateway.command.clone(),
                args: gateway.args.clone(),
                token_env: gateway.token_env.clone(),
            },
            signatures: gateway.signatures(),
            token_prefix: gateway.token_prefix.clone(),
            stale_grace: gateway.stale_grace(),
            startup_timeout: gateway.startup_timeout(),
            poll_interval: gateway.poll_interval(),
            providers,
        }
    }
}

type StartupFuture = Shared<BoxFuture<'static, Result<BackendProcess, StartupError>>>;

struct Slot {
    phase: ReadinessState,
    ready: Option<BackendProcess>,
    inflight: Option<StartupFuture>,
    abort: Option<AbortHandle>,
    generation: u64,
    /// Process this supervisor launched or adopted
    managed: Option<String>,
    last_error: Option<String>,
    /// Set by `shutdown`; no further startups are begun
    retired: bool,
}

/// Point-in-time view of a supervisor
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub tenant_id: String,
    pub state: ReadinessState,
    pub process_id: Option<String>,
    pub managed_process: Option<String>,
    pub last_error: Option<String>,
}

impl SupervisorSnapshot {
    /// Snapshot for a tenant nobody has asked for yet
    pub fn idle(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: ReadinessState::Unknown,
            process_id: None,
            managed_process: None,
            last_error: None,
        }
    }
}

/// Owns the gateway lifecycle for one tenant
pub struct TenantSupervisor {
    tenant_id: String,
    token: OnceLock<GatewayToken>,
    sandbox: Arc<dyn Sandbox>,
    probe: Arc<dyn ReadinessProbe>,
    settings: Arc<GatewaySettings>,
    slot: Mutex<Slot>,
}

impl std::fmt::Debug for TenantSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSupervisor")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl TenantSupervisor {
    pub fn new(
        tenant_id: &str,
        sandbox: Arc<dyn Sandbox>,
        probe: Arc<dyn ReadinessProbe>,
        settings: Arc<GatewaySettings>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            token: OnceLock::new(),
            sandbox,
            probe,
            settings,
            slot: Mutex::new(Slot {
                phase: ReadinessState::Unknown,
                ready: None,
                inflight: None,
                abort: None,
                generation: 0,
                managed: None,
                last_error: None,
                retired: false,
            }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The tenant's gateway token, derived on first use
    pub fn token(&self) -> &GatewayToken {
        self.token
            .get_or_init(|| GatewayToken::derive(&self.tenant_id, &self.settings.token_prefix))
    }

    pub fn state(&self) -> ReadinessState {
        self.slot.lock().phase
    }

    pub fn is_ready(&self) -> bool {
        self.slot.lock().ready.is_some()
    }

    pub fn ready_process(&self) -> Option<BackendProcess> {
        self.slot.lock().ready.clone()
    }

    /// Return the ready gateway, finding or launching it if needed
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<BackendProcess, StartupError> {
        let startup = {
            let mut slot = self.slot.lock();
            if slot.retired {
                return Err(self.removed());
            }
            if let Some(ref process) = slot.ready {
                return Ok(process.clone());
            }
            match slot.inflight.clone() {
                Some(inflight) => inflight,
                None => self.begin_startup(&mut slot),
            }
        };
        startup.await
    }

    fn begin_startup(self: &Arc<Self>, slot: &mut Slot) -> StartupFuture {
        slot.generation += 1;
        slot.phase = ReadinessState::Probing;
        let generation = slot.generation;

        debug!(tenant = %self.tenant_id, generation, "Starting gateway startup pipeline");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = this.run_startup(generation).await;
            this.finish(generation, &result);
            result
        });
        slot.abort = Some(handle.abort_handle());

        let this = Arc::clone(self);
        let startup = async move {
            match handle.await {
                Ok(result) => result,
                Err(_) if this.slot.lock().retired => Err(this.removed()),
                Err(e) => {
                    let result = Err(StartupError::Aborted {
                        message: e.to_string(),
                    });
                    this.finish(generation, &result);
                    result
                }
            }
        }
        .boxed()
        .shared();

        slot.inflight = Some(startup.clone());
        startup
    }

    /// Write an attempt's outcome, unless a newer attempt superseded it
    fn finish(&self, generation: u64, result: &Result<BackendProcess, StartupError>) {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            debug!(tenant = %self.tenant_id, generation, "Discarding outcome of superseded startup");
            return;
        }
        slot.inflight = None;
        slot.abort = None;
        match result {
            Ok(process) => {
                slot.phase = ReadinessState::Ready;
                slot.ready = Some(process.clone());
                slot.last_error = None;
            }
            Err(e) => {
                slot.phase = ReadinessState::Failed;
                slot.ready = None;
                slot.last_error = Some(e.to_string());
            }
        }
    }

    fn set_phase(&self, generation: u64, phase: ReadinessState) {
        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.phase = phase;
        }
    }

    /// Record the process as ours; false once the supervisor is retired
    fn set_managed(&self, process_id: &str) -> bool {
        let mut slot = self.slot.lock();
        if slot.retired {
            return false;
        }
        slot.managed = Some(process_id.to_string());
        true
    }

    fn removed(&self) -> StartupError {
        StartupError::Removed {
            tenant_id: self.tenant_id.clone(),
        }
    }

    async fn kill_best_effort(&self, process: &BackendProcess, reason: &str) {
        info!(tenant = %self.tenant_id, process_id = %process.id, reason, "Terminating gateway process");
        if let Err(e) = self.sandbox.kill_process(&process.id).await {
            warn!(
                tenant = %self.tenant_id,
                process_id = %process.id,
                error = %e,
                "Failed to terminate gateway process"
            );
        }
    }

    /// Terminate every live gateway in the sandbox except `keep`
    async fn reap(&self, keep: Option<&str>, reason: &str) {
        let found = locator::candidates(self.sandbox.as_ref(), &self.settings.signatures, keep).await;
        for process in found.iter().filter(|p| Some(p.id.as_str()) != keep) {
            self.kill_best_effort(process, reason).await;
        }
    }

    async fn run_startup(&self, generation: u64) -> Result<BackendProcess, StartupError> {
        let settings = Arc::clone(&self.settings);
        let managed = self.slot.lock().managed.clone();

        if let Some(existing) =
            locator::find(self.sandbox.as_ref(), &settings.signatures, managed.as_deref()).await
        {
            debug!(
                tenant = %self.tenant_id,
                process_id = %existing.id,
                "Found running gateway, checking readiness"
            );

            match readiness::wait_ready(
                self.probe.as_ref(),
                existing.addr,
                settings.stale_grace,
                settings.poll_interval,
            )
            .await
            {
                Ok(()) => {
                    if !self.set_managed(&existing.id) {
                        self.kill_best_effort(&existing, "bot removed").await;
                        return Err(self.removed());
                    }
                    self.reap(Some(&existing.id), "duplicate gateway").await;
                    info!(tenant = %self.tenant_id, process_id = %existing.id, "Reusing running gateway");
                    return Ok(existing);
                }
                Err(timeout) => {
                    warn!(
                        tenant = %self.tenant_id,
                        process_id = %existing.id,
                        last_probe = %timeout.last,
                        "Running gateway is not responding, replacing it"
                    );
                    self.reap(None, "stale gateway").await;
                }
            }
        }

        self.set_phase(generation, ReadinessState::LaunchPending);

        let process = launcher::launch(
            self.sandbox.as_ref(),
            &settings.command,
            &settings.providers,
            self.token(),
        )
        .await
        .map_err(|e| {
            warn!(tenant = %self.tenant_id, error = %e, "Gateway launch failed");
            StartupError::launch(format!("{:#}", e))
        })?;

        if !self.set_managed(&process.id) {
            self.kill_best_effort(&process, "bot removed").await;
            return Err(self.removed());
        }
        self.set_phase(generation, ReadinessState::WaitingReady);
        info!(
            tenant = %self.tenant_id,
            process_id = %process.id,
            addr = %process.addr,
            "Gateway launched, waiting for readiness"
        );

        match readiness::wait_ready(
            self.probe.as_ref(),
            process.addr,
            settings.startup_timeout,
            settings.poll_interval,
        )
        .await
        {
            Ok(()) => {
                info!(tenant = %self.tenant_id, process_id = %process.id, "Gateway ready");
                Ok(process)
            }
            Err(timeout) => {
                // The process stays up so its output can be inspected
                let logs = match self.sandbox.process_logs(&process.id).await {
                    Ok(logs) if !logs.is_empty() => Some(logs),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(tenant = %self.tenant_id, error = %e, "Gateway logs unavailable");
                        None
                    }
                };
                warn!(
                    tenant = %self.tenant_id,
                    process_id = %process.id,
                    waited_secs = timeout.waited.as_secs(),
                    last_probe = %timeout.last,
                    "Gateway did not become ready"
                );
                Err(StartupError::ReadinessTimeout {
                    waited: timeout.waited,
                    last_probe: timeout.last.to_string(),
                    logs,
                })
            }
        }
    }

    /// Drop the cached ready process after a forwarding failure against it
    pub fn invalidate(&self, process_id: &str) {
        let mut slot = self.slot.lock();
        let matches = slot.ready.as_ref().is_some_and(|p| p.id == process_id);
        if matches {
            warn!(tenant = %self.tenant_id, process_id, "Gateway unreachable, readiness invalidated");
            slot.ready = None;
            slot.phase = ReadinessState::Unknown;
        }
    }

    /// Cancel any startup and terminate the managed gateway
    ///
    /// Final: later `ensure_ready` calls fail with [`StartupError::Removed`].
    pub async fn shutdown(&self) {
        let managed = {
            let mut slot = self.slot.lock();
            slot.retired = true;
            slot.generation += 1;
            if let Some(abort) = slot.abort.take() {
                abort.abort();
            }
            slot.inflight = None;
            slot.ready = None;
            slot.phase = ReadinessState::Unknown;
            slot.managed.take()
        };

        if let Some(id) = managed {
            info!(tenant = %self.tenant_id, process_id = %id, "Stopping gateway");
            if let Err(e) = self.sandbox.kill_process(&id).await {
                debug!(tenant = %self.tenant_id, process_id = %id, error = %e, "Gateway already gone");
            }
        }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let slot = self.slot.lock();
        SupervisorSnapshot {
            tenant_id: self.tenant_id.clone(),
            state: slot.phase,
            process_id: slot.ready.as_ref().map(|p| p.id.clone()),
            managed_process: slot.managed.clone(),
            last_error: slot.last_error.clone(),
        }
    }
}

/// All tenant supervisors, keyed by tenant id
pub struct Fleet {
    supervisors: DashMap<String, Arc<TenantSupervisor>>,
    /// Tenants whose bot was deleted; never given a supervisor again
    removed: DashSet<String>,
    provider: Arc<dyn SandboxProvider>,
    probe: Arc<dyn ReadinessProbe>,
    settings: Arc<GatewaySettings>,
}

impl Fleet {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        probe: Arc<dyn ReadinessProbe>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            supervisors: DashMap::new(),
            removed: DashSet::new(),
            provider,
            probe,
            settings: Arc::new(settings),
        }
    }

    /// The tenant's supervisor, created with its sandbox on first use
    pub fn get_or_create(&self, tenant_id: &str) -> Result<Arc<TenantSupervisor>, StartupError> {
        if let Some(existing) = self.supervisors.get(tenant_id) {
            return Ok(Arc::clone(existing.value()));
        }

        match self.supervisors.entry(tenant_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                // Checked under the entry lock so a concurrent remove cannot slip past
                if self.removed.contains(tenant_id) {
                    debug!(tenant = tenant_id, "Refusing supervisor for removed bot");
                    return Err(StartupError::Removed {
                        tenant_id: tenant_id.to_string(),
                    });
                }
                let sandbox = self
                    .provider
                    .sandbox(tenant_id)
                    .map_err(|e| StartupError::launch(format!("{:#}", e)))?;
                let supervisor = Arc::new(TenantSupervisor::new(
                    tenant_id,
                    sandbox,
                    Arc::clone(&self.probe),
                    Arc::clone(&self.settings),
                ));
                debug!(tenant = tenant_id, "Created gateway supervisor");
                entry.insert(Arc::clone(&supervisor));
                Ok(supervisor)
            }
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantSupervisor>> {
        self.supervisors.get(tenant_id).map(|s| Arc::clone(s.value()))
    }

    /// Stop the tenant's gateway and release its sandbox for good
    pub async fn remove(&self, tenant_id: &str) {
        self.removed.insert(tenant_id.to_string());
        if let Some((_, supervisor)) = self.supervisors.remove(tenant_id) {
            supervisor.shutdown().await;
        }
        self.provider.release(tenant_id).await;
    }

    /// Stop every gateway
    pub async fn stop_all(&self) {
        let tenants: Vec<String> = self.supervisors.iter().map(|e| e.key().clone()).collect();
        info!(count = tenants.len(), "Stopping all gateways");
        for tenant in tenants {
            self.remove(&tenant).await;
        }
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SupervisorSnapshot> {
        let mut snapshots: Vec<_> = self.supervisors.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        snapshots
    }
}
