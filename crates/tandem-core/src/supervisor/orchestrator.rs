//! Start, stop, restart and inspect the backend/frontend pair.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::shutdown::ShutdownLatch;
use crate::config::{OrchestratorConfig, ServiceSpec};
use crate::error::{OrchestratorError, Result};
use crate::health::{HealthGate, NetworkProbe, Probe};
use crate::observability::{EventEmitter, LifecycleEvent};
use crate::preflight::{
    Acknowledge, AutoAcknowledge, Bootstrapper, DependencyInstaller, EnvironmentValidator,
    TerminalPrompt,
};
use crate::process::{
    terminate, Launch, LsofInspector, PortInspector, PortReconciler, ProcessLauncher, SignalScope,
    Signaller, SystemSignaller, TerminateOutcome,
};
use crate::retry::{Clock, TokioClock};
use crate::state::{FileStore, LifecycleStore, OrchestrationState, ProcessHandle, TierState};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Stopped,
    Validating,
    Bootstrapping,
    Installing,
    ReconcilingPorts,
    StartingBackend,
    StartingFrontend,
    Running,
    Stopping,
    Failed,
}

/// The supervisor's effectful dependencies.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn LifecycleStore>,
    pub launcher: Arc<dyn Launch>,
    pub probe: Arc<dyn Probe>,
    pub signaller: Arc<dyn Signaller>,
    pub ports: Arc<dyn PortInspector>,
    pub clock: Arc<dyn Clock>,
    pub acknowledge: Arc<dyn Acknowledge>,
}

impl Collaborators {
    /// Real processes, real network, pid files under the configured state dir.
    pub fn system(config: &OrchestratorConfig, interactive: bool) -> Self {
        let acknowledge: Arc<dyn Acknowledge> = if interactive {
            Arc::new(TerminalPrompt)
        } else {
            Arc::new(AutoAcknowledge)
        };

        Self {
            store: Arc::new(FileStore::new(&config.state_dir)),
            launcher: Arc::new(ProcessLauncher::new()),
            probe: Arc::new(NetworkProbe::new()),
            signaller: Arc::new(SystemSignaller),
            ports: Arc::new(LsofInspector),
            clock: Arc::new(TokioClock),
            acknowledge,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StartReport {
    Started {
        backend: ProcessHandle,
        frontend: ProcessHandle,
    },
    /// Both tiers were already live and reachable; nothing was launched.
    AlreadyRunning {
        backend: ProcessHandle,
        frontend: ProcessHandle,
    },
}

#[derive(Debug, Clone)]
pub struct TierStop {
    pub tier: String,
    pub pid: u32,
    pub outcome: TerminateOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub tiers: Vec<TierStop>,
}

impl StopReport {
    /// False when there was nothing live to stop.
    pub fn was_running(&self) -> bool {
        self.tiers
            .iter()
            .any(|t| t.outcome != TerminateOutcome::AlreadyExited)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: OrchestrationState,
    pub tiers: Vec<TierState>,
    pub recent_events: Vec<LifecycleEvent>,
}

/// Owns the tier-name → handle mapping and every transition of it.
pub struct Supervisor {
    config: OrchestratorConfig,
    store: Arc<dyn LifecycleStore>,
    launcher: Arc<dyn Launch>,
    signaller: Arc<dyn Signaller>,
    clock: Arc<dyn Clock>,
    acknowledge: Arc<dyn Acknowledge>,
    health: HealthGate,
    reconciler: PortReconciler,
    installer: DependencyInstaller,
    events: EventEmitter,
    latch: ShutdownLatch,
    phase: Mutex<RunPhase>,
}

impl Supervisor {
    pub fn new(config: OrchestratorConfig, parts: Collaborators) -> Self {
        let reconciler = PortReconciler::new(
            parts.ports.clone(),
            parts.signaller.clone(),
            parts.clock.clone(),
            config.settle_delay(),
        );
        let health = HealthGate::new(
            parts.probe.clone(),
            parts.signaller.clone(),
            parts.clock.clone(),
        );
        let events = EventEmitter::new(&config.events_file);

        Self {
            config,
            store: parts.store,
            launcher: parts.launcher,
            signaller: parts.signaller,
            clock: parts.clock,
            acknowledge: parts.acknowledge,
            health,
            reconciler,
            installer: DependencyInstaller::new(),
            events,
            latch: ShutdownLatch::new(),
            phase: Mutex::new(RunPhase::Stopped),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.lock().map(|p| *p).unwrap_or(RunPhase::Failed)
    }

    fn enter(&self, phase: RunPhase) {
        if let Ok(mut current) = self.phase.lock() {
            if *current != phase {
                tracing::debug!(from = ?*current, to = ?phase, "Phase transition");
                *current = phase;
            }
        }
    }

    fn fail(&self, err: OrchestratorError) -> OrchestratorError {
        self.enter(RunPhase::Failed);
        self.events.emit_simple("run_failed", &err.to_string());
        err
    }

    /// Bring both tiers up in dependency order.
    ///
    /// Handles are recorded once both tiers pass their gates. Any fatal
    /// failure terminates the tiers this call started, newest first, and
    /// clears their records before the error is returned.
    pub async fn start(&self) -> Result<StartReport> {
        self.enter(RunPhase::Validating);
        // Nothing, the journal included, is touched until validation passes.
        if let Err(e) = EnvironmentValidator::new(&self.config.required_tools).validate() {
            self.enter(RunPhase::Failed);
            return Err(e);
        }
        self.events.emit_simple("run_started", "Starting tiers");

        if let Some(report) = self.already_running().await.map_err(|e| self.fail(e))? {
            self.enter(RunPhase::Running);
            return Ok(report);
        }
        self.retire_previous().await.map_err(|e| self.fail(e))?;

        self.enter(RunPhase::Bootstrapping);
        Bootstrapper::new(
            &self.config.settings_file,
            self.config.settings_template.clone(),
        )
        .ensure(self.acknowledge.as_ref())
        .map_err(|e| self.fail(e))?;

        self.enter(RunPhase::Installing);
        for spec in [&self.config.frontend, &self.config.backend] {
            self.installer.ensure(spec).await;
        }

        self.enter(RunPhase::ReconcilingPorts);
        for spec in self.config.tiers() {
            if let Err(e) = self.reconciler.reconcile(spec.port).await {
                tracing::warn!(tier = %spec.name, error = %e, "Port not reclaimed; the tier's bind will decide");
            }
        }

        let mut started: Vec<ProcessHandle> = Vec::with_capacity(2);

        self.enter(RunPhase::StartingBackend);
        let backend = self.launch_and_gate(&self.config.backend, &mut started).await?;

        self.enter(RunPhase::StartingFrontend);
        let frontend = self.launch_and_gate(&self.config.frontend, &mut started).await?;

        for handle in &started {
            if let Err(e) = self.store.put(handle) {
                self.rollback(&started).await;
                return Err(self.fail(e));
            }
        }

        self.enter(RunPhase::Running);
        self.events.emit_simple(
            "running",
            &format!("backend pid {}, frontend pid {}", backend.pid, frontend.pid),
        );

        Ok(StartReport::Started { backend, frontend })
    }

    async fn launch_and_gate(
        &self,
        spec: &ServiceSpec,
        started: &mut Vec<ProcessHandle>,
    ) -> Result<ProcessHandle> {
        let handle = match self.launcher.launch(spec) {
            Ok(handle) => handle,
            Err(e) => {
                self.rollback(started).await;
                return Err(self.fail(e));
            }
        };
        self.events
            .emit_tier("tier_launched", &spec.name, Some(handle.pid), &spec.command);
        started.push(handle.clone());

        match self.health.wait_ready(spec, &handle).await {
            Ok(attempts) => {
                self.events.emit_tier(
                    "tier_ready",
                    &spec.name,
                    Some(handle.pid),
                    &format!("ready after {attempts} attempt(s)"),
                );
                Ok(handle)
            }
            Err(e) => {
                let kind = match e {
                    OrchestratorError::TierExited { .. } => "tier_exited",
                    _ => "health_timeout",
                };
                self.events
                    .emit_tier(kind, &spec.name, Some(handle.pid), &e.to_string());
                self.rollback(started).await;
                Err(self.fail(e))
            }
        }
    }

    /// Terminate tiers started by this run, newest first.
    async fn rollback(&self, started: &[ProcessHandle]) {
        for handle in started.iter().rev() {
            let outcome = terminate(
                self.signaller.as_ref(),
                self.clock.as_ref(),
                handle.pid,
                SignalScope::Group,
                self.config.stop_grace(),
            )
            .await;
            tracing::warn!(tier = %handle.service, pid = handle.pid, ?outcome, "Rolled back tier");

            if let Err(e) = self.store.clear(&handle.service) {
                tracing::warn!(tier = %handle.service, error = %e, "Could not clear handle during rollback");
            }
            self.events.emit_tier(
                "rollback",
                &handle.service,
                Some(handle.pid),
                &format!("{outcome:?}"),
            );
        }
    }

    async fn already_running(&self) -> Result<Option<StartReport>> {
        let backend = self.inspect(&self.config.backend).await?;
        let frontend = self.inspect(&self.config.frontend).await?;

        match (backend.is_valid(), frontend.is_valid(), backend.handle, frontend.handle) {
            (true, true, Some(backend), Some(frontend)) => {
                tracing::info!(
                    backend_pid = backend.pid,
                    frontend_pid = frontend.pid,
                    "Both tiers already running"
                );
                Ok(Some(StartReport::AlreadyRunning { backend, frontend }))
            }
            _ => Ok(None),
        }
    }

    /// Stop whatever an earlier run recorded but is no longer fully healthy,
    /// so a half-dead pair is replaced as a whole. An earlier instance that
    /// never got as far as recording its handles is handled by port
    /// reconciliation instead.
    async fn retire_previous(&self) -> Result<()> {
        let mut leftovers = false;
        for spec in self.config.tiers() {
            leftovers |= self.store.get(&spec.name)?.is_some();
        }
        if leftovers {
            tracing::info!("Retiring tiers from a previous run");
            self.stop().await?;
        }
        Ok(())
    }

    /// Terminate every stored tier and clear the store. Idempotent.
    pub async fn stop(&self) -> Result<StopReport> {
        self.enter(RunPhase::Stopping);
        let mut report = StopReport::default();
        let mut held: Vec<&ServiceSpec> = Vec::new();

        for spec in self.config.tiers().into_iter().rev() {
            let Some(handle) = self.store.get(&spec.name)? else {
                continue;
            };
            held.push(spec);

            let outcome = terminate(
                self.signaller.as_ref(),
                self.clock.as_ref(),
                handle.pid,
                SignalScope::Group,
                self.config.stop_grace(),
            )
            .await;
            match outcome {
                TerminateOutcome::AlreadyExited => {
                    tracing::info!(tier = %spec.name, pid = handle.pid, "Stale handle, process already gone")
                }
                TerminateOutcome::Survived => {
                    tracing::warn!(tier = %spec.name, pid = handle.pid, "Process survived SIGKILL")
                }
                _ => tracing::info!(tier = %spec.name, pid = handle.pid, ?outcome, "Stopped tier"),
            }
            self.events.emit_tier(
                "tier_stopped",
                &spec.name,
                Some(handle.pid),
                &format!("{outcome:?}"),
            );

            report.tiers.push(TierStop {
                tier: spec.name.clone(),
                pid: handle.pid,
                outcome,
            });
        }

        // Children that escaped the process group may still hold the port.
        for spec in &held {
            if let Err(e) = self.reconciler.reconcile(spec.port).await {
                tracing::warn!(tier = %spec.name, error = %e, "Port still held after stop");
            }
        }

        for spec in self.config.tiers() {
            self.store.clear(&spec.name)?;
        }

        self.enter(RunPhase::Stopped);
        if report.was_running() {
            self.events.emit_simple("stopped", "All tiers stopped");
        } else {
            tracing::info!("Nothing was running");
        }
        Ok(report)
    }

    /// Stop, settle, start.
    pub async fn restart(&self) -> Result<StartReport> {
        self.stop().await?;
        self.clock.sleep(self.config.restart_settle()).await;
        self.start().await
    }

    /// Idle until `cancel` fires, then tear down once.
    ///
    /// Returns `None` when another caller already owns the teardown.
    pub async fn supervise(&self, cancel: CancellationToken) -> Result<Option<StopReport>> {
        cancel.cancelled().await;

        if !self.latch.begin() {
            tracing::debug!("Teardown already in progress");
            return Ok(None);
        }

        tracing::info!("Interrupt received, stopping tiers");
        self.events.emit_simple("interrupted", "Stopping tiers on interrupt");
        self.stop().await.map(Some)
    }

    async fn inspect(&self, spec: &ServiceSpec) -> Result<TierState> {
        let handle = self.store.get(&spec.name)?;
        let alive = handle
            .as_ref()
            .is_some_and(|h| self.signaller.is_alive(h.pid));
        let reachable = self.health.is_ready(spec).await;

        Ok(TierState {
            name: spec.name.clone(),
            port: spec.port,
            handle,
            alive,
            reachable,
        })
    }

    /// Probe both tiers independently. Read-only.
    pub async fn status(&self) -> Result<StatusReport> {
        let tiers = join_all(self.config.tiers().into_iter().map(|spec| self.inspect(spec)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let state = match tiers.as_slice() {
            [backend, frontend] => OrchestrationState::derive(backend, frontend),
            _ => OrchestrationState::Stopped,
        };

        Ok(StatusReport {
            state,
            tiers,
            recent_events: self.events.read_recent(5),
        })
    }
}
