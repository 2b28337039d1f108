use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tandem_core::config::{HealthConfig, OrchestratorConfig, ProbeSpec, ServiceSpec};
use tandem_core::error::OrchestratorError;
use tandem_core::health::Probe;
use tandem_core::preflight::Acknowledge;
use tandem_core::process::{Launch, PortInspector, Signal, SignalScope, Signaller, TerminateOutcome};
use tandem_core::retry::Clock;
use tandem_core::state::{FileStore, LifecycleStore, MemoryStore, OrchestrationState, ProcessHandle};
use tandem_core::supervisor::{Collaborators, RunPhase, StartReport, Supervisor};

#[derive(Debug, Clone)]
struct FakeProcess {
    tier: String,
    port: Option<u16>,
    alive: bool,
    ignores_term: bool,
    ignores_kill: bool,
}

/// A tiny simulated host: processes, listening ports, signals and a clock.
#[derive(Default)]
struct World {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    next_pid: Mutex<u32>,
    launches: Mutex<Vec<String>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    sleeps: Mutex<Vec<Duration>>,
    never_ready: Mutex<HashSet<String>>,
    launch_fails: Mutex<HashSet<String>>,
    acks: Mutex<u32>,
}

impl World {
    fn new() -> Arc<Self> {
        let world = Self::default();
        *world.next_pid.lock().unwrap() = 1000;
        Arc::new(world)
    }

    fn spawn(&self, tier: &str, port: Option<u16>, ignores_term: bool) -> u32 {
        self.insert(tier, port, ignores_term, false)
    }

    /// A listener no signal can remove, as when it belongs to another user.
    fn spawn_unkillable(&self, tier: &str, port: u16) -> u32 {
        self.insert(tier, Some(port), true, true)
    }

    fn insert(&self, tier: &str, port: Option<u16>, ignores_term: bool, ignores_kill: bool) -> u32 {
        let pid = {
            let mut next = self.next_pid.lock().unwrap();
            *next += 1;
            *next
        };
        self.processes.lock().unwrap().insert(
            pid,
            FakeProcess {
                tier: tier.to_string(),
                port,
                alive: true,
                ignores_term,
                ignores_kill,
            },
        );
        pid
    }

    fn alive(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|p| p.alive)
    }

    fn live_pids_for(&self, tier: &str) -> Vec<u32> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.alive && p.tier == tier)
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn listener_on(&self, port: u16) -> Option<u32> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .find(|(_, p)| p.alive && p.port == Some(port))
            .map(|(pid, _)| *pid)
    }

    fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().unwrap().clone()
    }

    fn sleeps_of(&self, duration: Duration) -> usize {
        self.sleeps
            .lock()
            .unwrap()
            .iter()
            .filter(|d| **d == duration)
            .count()
    }

    fn never_ready(&self, tier: &str) {
        self.never_ready.lock().unwrap().insert(tier.to_string());
    }

    fn fail_launch(&self, tier: &str) {
        self.launch_fails.lock().unwrap().insert(tier.to_string());
    }
}

impl Launch for World {
    fn launch(&self, spec: &ServiceSpec) -> tandem_core::error::Result<ProcessHandle> {
        self.launches.lock().unwrap().push(spec.name.clone());
        if self.launch_fails.lock().unwrap().contains(&spec.name) {
            return Err(OrchestratorError::TierLaunchFailure {
                tier: spec.name.clone(),
                log: spec.log_file.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let binds = !self.never_ready.lock().unwrap().contains(&spec.name);
        let taken = self.listener_on(spec.port).is_some();
        let pid = self.spawn(&spec.name, binds.then_some(spec.port), false);
        // A tier whose port is already taken fails its bind and exits.
        if taken {
            if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
                process.alive = false;
                process.port = None;
            }
        }
        Ok(ProcessHandle::new(&spec.name, pid))
    }
}

#[async_trait]
impl Probe for World {
    async fn check(&self, probe: &ProbeSpec, _timeout: Duration) -> Result<(), String> {
        let port: u16 = probe
            .target()
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or("unparseable probe target")?;
        match self.listener_on(port) {
            Some(_) => Ok(()),
            None => Err("connection refused".to_string()),
        }
    }
}

impl Signaller for World {
    fn signal(&self, pid: u32, signal: Signal, _scope: SignalScope) -> std::io::Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        let mut processes = self.processes.lock().unwrap();
        match processes.get_mut(&pid) {
            Some(process) if process.alive && process.ignores_kill => Err(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )),
            Some(process) if process.alive => {
                if signal == Signal::Kill || !process.ignores_term {
                    process.alive = false;
                    process.port = None;
                }
                Ok(())
            }
            _ => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive(pid)
    }
}

#[async_trait]
impl PortInspector for World {
    async fn listeners(&self, port: u16) -> std::io::Result<Vec<u32>> {
        let mut pids: Vec<u32> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.alive && p.port == Some(port))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }
}

#[async_trait]
impl Clock for World {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

impl Acknowledge for World {
    fn acknowledge(&self, _settings: &Path) -> std::io::Result<()> {
        *self.acks.lock().unwrap() += 1;
        Ok(())
    }
}

fn parts(world: &Arc<World>, store: Arc<dyn LifecycleStore>) -> Collaborators {
    Collaborators {
        store,
        launcher: world.clone(),
        probe: world.clone(),
        signaller: world.clone(),
        ports: world.clone(),
        clock: world.clone(),
        acknowledge: world.clone(),
    }
}

fn config(dir: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.required_tools.clear();
    config.settings_template = None;
    for spec in [&mut config.backend, &mut config.frontend] {
        spec.install = None;
        spec.log_file = None;
        spec.probe = ProbeSpec::Tcp {
            address: "127.0.0.1:{port}".to_string(),
        };
        spec.health = HealthConfig {
            attempts: 10,
            interval_ms: 1000,
            probe_timeout_ms: 100,
        };
    }
    config.resolve_paths(dir);
    config
}

fn supervisor(dir: &Path, world: &Arc<World>, store: Arc<dyn LifecycleStore>) -> Supervisor {
    Supervisor::new(config(dir), parts(world, store))
}

fn started(report: StartReport) -> (ProcessHandle, ProcessHandle) {
    match report {
        StartReport::Started { backend, frontend } => (backend, frontend),
        other => panic!("expected a fresh start, got {other:?}"),
    }
}

#[tokio::test]
async fn start_launches_backend_before_frontend_and_stores_both() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let (backend, frontend) = started(sup.start().await.unwrap());

    assert_eq!(world.launches(), vec!["backend", "frontend"]);
    assert_eq!(store.get("backend").unwrap(), Some(backend.clone()));
    assert_eq!(store.get("frontend").unwrap(), Some(frontend.clone()));
    assert_eq!(world.listener_on(8001), Some(backend.pid));
    assert_eq!(world.listener_on(3000), Some(frontend.pid));
    assert_eq!(sup.phase(), RunPhase::Running);

    let status = sup.status().await.unwrap();
    assert_eq!(status.state, OrchestrationState::Running);
    assert!(status.tiers.iter().all(|t| t.alive && t.reachable));
}

#[tokio::test]
async fn backend_timeout_never_launches_frontend() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    world.never_ready("backend");
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let err = sup.start().await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::HealthTimeout { ref tier, attempts: 10, .. } if tier == "backend"
    ));
    assert!(err.is_fatal());
    assert_eq!(world.launches(), vec!["backend"]);
    assert!(store.get("frontend").unwrap().is_none());
    assert!(store.get("backend").unwrap().is_none());
    assert!(world.live_pids_for("backend").is_empty());
    // Ten attempts, one interval between each.
    assert_eq!(world.sleeps_of(Duration::from_secs(1)), 9);
    assert_eq!(sup.phase(), RunPhase::Failed);
}

#[tokio::test]
async fn frontend_timeout_rolls_back_backend() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    world.never_ready("frontend");
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let err = sup.start().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::HealthTimeout { ref tier, .. } if tier == "frontend"));
    assert!(world.live_pids_for("backend").is_empty());
    assert!(world.live_pids_for("frontend").is_empty());
    assert!(store.is_empty());

    // Newest first: frontend is terminated before backend.
    let terminated: Vec<u32> = world
        .signals()
        .into_iter()
        .filter(|(_, s)| *s == Signal::Terminate)
        .map(|(pid, _)| pid)
        .collect();
    assert_eq!(terminated.len(), 2);
    assert!(terminated[0] > terminated[1]);
}

#[tokio::test]
async fn frontend_launch_failure_rolls_back_backend() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    world.fail_launch("frontend");
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let err = sup.start().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::TierLaunchFailure { .. }));
    assert_eq!(err.step(), "launch tier");
    assert_eq!(world.launches(), vec!["backend", "frontend"]);
    assert!(world.live_pids_for("backend").is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn backend_launch_failure_touches_nothing_else() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    world.fail_launch("backend");
    let sup = supervisor(dir.path(), &world, Arc::new(MemoryStore::new()));

    let err = sup.start().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::TierLaunchFailure { ref tier, .. } if tier == "backend"));
    assert_eq!(world.launches(), vec!["backend"]);
    assert!(world.signals().is_empty());
}

#[tokio::test]
async fn second_start_is_a_no_op_when_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store: Arc<dyn LifecycleStore> = Arc::new(MemoryStore::new());

    let first = supervisor(dir.path(), &world, store.clone());
    let (backend, frontend) = started(first.start().await.unwrap());

    let second = supervisor(dir.path(), &world, store.clone());
    match second.start().await.unwrap() {
        StartReport::AlreadyRunning {
            backend: b,
            frontend: f,
        } => {
            assert_eq!(b.pid, backend.pid);
            assert_eq!(f.pid, frontend.pid);
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    assert_eq!(world.launches().len(), 2);
    assert_eq!(world.live_pids_for("backend"), vec![backend.pid]);
    assert_eq!(world.live_pids_for("frontend"), vec![frontend.pid]);
}

#[tokio::test]
async fn start_replaces_a_half_dead_previous_pair() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());

    // Previous run reached RUNNING; its frontend has since crashed.
    let old_backend = world.spawn("backend", Some(8001), false);
    store.put(&ProcessHandle::new("backend", old_backend)).unwrap();
    store.put(&ProcessHandle::new("frontend", 4243)).unwrap();

    let sup = supervisor(dir.path(), &world, store.clone());
    let (backend, frontend) = started(sup.start().await.unwrap());

    assert!(!world.alive(old_backend));
    assert!(world.signals().contains(&(old_backend, Signal::Terminate)));
    assert_eq!(world.live_pids_for("backend"), vec![backend.pid]);
    assert_eq!(world.live_pids_for("frontend"), vec![frontend.pid]);
    assert_eq!(store.get("backend").unwrap().map(|h| h.pid), Some(backend.pid));
    assert_eq!(store.get("frontend").unwrap().map(|h| h.pid), Some(frontend.pid));
}

#[tokio::test]
async fn start_reclaims_ports_from_an_unrecorded_earlier_instance() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());

    // An earlier start still inside its frontend gate: backend bound, nothing recorded.
    let earlier_backend = world.spawn("backend", Some(8001), false);

    let sup = supervisor(dir.path(), &world, store.clone());
    let (backend, _) = started(sup.start().await.unwrap());

    assert!(!world.alive(earlier_backend));
    assert_eq!(world.live_pids_for("backend"), vec![backend.pid]);
    assert_eq!(world.listener_on(8001), Some(backend.pid));
}

#[tokio::test]
async fn tier_that_loses_its_bind_is_not_reported_ready() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let foreign = world.spawn_unkillable("foreign", 8001);
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let err = sup.start().await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::TierExited { ref tier, .. } if tier == "backend"
    ));
    assert!(err.is_fatal());
    assert_eq!(err.step(), "health gate");
    assert_eq!(world.launches(), vec!["backend"]);
    assert!(store.is_empty());
    assert!(world.alive(foreign));
    assert_eq!(sup.phase(), RunPhase::Failed);
    // The gate gave up on the first attempt instead of trusting the foreign answer.
    assert_eq!(world.sleeps_of(Duration::from_secs(1)), 0);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let report = sup.stop().await.unwrap();
    assert!(!report.was_running());
    assert!(report.tiers.is_empty());
    assert!(store.is_empty());

    sup.start().await.unwrap();
    let report = sup.stop().await.unwrap();
    assert!(report.was_running());
    assert_eq!(report.tiers.len(), 2);

    let again = sup.stop().await.unwrap();
    assert!(!again.was_running());
    assert!(store.is_empty());
    assert_eq!(sup.phase(), RunPhase::Stopped);
}

#[tokio::test]
async fn stale_handles_are_cleared_without_signalling() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());
    // Recorded pid that no longer exists.
    store.put(&ProcessHandle::new("backend", 4242)).unwrap();

    let report = supervisor(dir.path(), &world, store.clone())
        .stop()
        .await
        .unwrap();

    assert!(!report.was_running());
    assert_eq!(report.tiers[0].outcome, TerminateOutcome::AlreadyExited);
    assert!(world.signals().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn stale_listeners_are_reclaimed_gracefully_then_forcibly() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let polite = world.spawn("crashed-api", Some(8001), false);
    let stubborn = world.spawn("crashed-web", Some(3000), true);
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    let (backend, frontend) = started(sup.start().await.unwrap());

    assert!(!world.alive(polite));
    assert!(!world.alive(stubborn));
    let signals = world.signals();
    assert!(signals.contains(&(polite, Signal::Terminate)));
    assert!(!signals.contains(&(polite, Signal::Kill)));
    assert!(signals.contains(&(stubborn, Signal::Terminate)));
    assert!(signals.contains(&(stubborn, Signal::Kill)));
    // One settle for the polite owner, two for the stubborn one.
    assert_eq!(world.sleeps_of(Duration::from_secs(2)), 3);

    assert_eq!(world.listener_on(8001), Some(backend.pid));
    assert_eq!(world.listener_on(3000), Some(frontend.pid));
}

#[tokio::test]
async fn restart_matches_a_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store: Arc<dyn LifecycleStore> = Arc::new(MemoryStore::new());

    let (old_backend, old_frontend) =
        started(supervisor(dir.path(), &world, store.clone()).start().await.unwrap());

    let restarter = supervisor(dir.path(), &world, store.clone());
    let (backend, frontend) = started(restarter.restart().await.unwrap());
    let restarted = restarter.status().await.unwrap();

    assert!(!world.alive(old_backend.pid));
    assert!(!world.alive(old_frontend.pid));
    assert_ne!(backend.pid, old_backend.pid);
    assert_ne!(frontend.pid, old_frontend.pid);

    let fresh_dir = tempfile::tempdir().unwrap();
    let fresh_world = World::new();
    let fresh = supervisor(fresh_dir.path(), &fresh_world, Arc::new(MemoryStore::new()));
    fresh.start().await.unwrap();
    let clean = fresh.status().await.unwrap();

    let shape = |tiers: &[tandem_core::state::TierState]| {
        tiers
            .iter()
            .map(|t| (t.name.clone(), t.port, t.alive, t.reachable, t.handle.is_some()))
            .collect::<Vec<_>>()
    };
    assert_eq!(restarted.state, clean.state);
    assert_eq!(shape(&restarted.tiers), shape(&clean.tiers));
}

#[tokio::test]
async fn interrupt_tears_down_once() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());
    let (backend, frontend) = started(sup.start().await.unwrap());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = sup.supervise(cancel.clone()).await.unwrap().unwrap();

    assert_eq!(report.tiers.len(), 2);
    assert!(report
        .tiers
        .iter()
        .all(|t| t.outcome == TerminateOutcome::Exited));
    assert!(!world.alive(backend.pid));
    assert!(!world.alive(frontend.pid));
    assert!(store.is_empty());

    // A second interrupt does not re-enter teardown.
    let signals_before = world.signals().len();
    assert!(sup.supervise(cancel).await.unwrap().is_none());
    assert_eq!(world.signals().len(), signals_before);
}

#[tokio::test]
async fn interrupt_during_startup_is_deferred_to_the_supervisory_wait() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());

    // Signal arrives before startup finishes.
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (backend, frontend) = started(sup.start().await.unwrap());
    assert_eq!(store.len(), 2);

    let report = sup.supervise(cancel).await.unwrap().unwrap();

    assert!(report.was_running());
    assert!(!world.alive(backend.pid));
    assert!(!world.alive(frontend.pid));
    assert!(store.is_empty());
    assert_eq!(sup.phase(), RunPhase::Stopped);
}

#[tokio::test]
async fn seeds_settings_and_waits_for_acknowledgment() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".env.example"), "GOOGLE_API_KEY=\n").unwrap();
    let world = World::new();

    let mut cfg = config(dir.path());
    cfg.settings_template = Some(dir.path().join(".env.example"));
    let sup = Supervisor::new(cfg, parts(&world, Arc::new(MemoryStore::new())));

    sup.start().await.unwrap();

    assert!(dir.path().join(".env").exists());
    assert_eq!(*world.acks.lock().unwrap(), 1);
    assert_eq!(sup.status().await.unwrap().state, OrchestrationState::Running);
}

#[tokio::test]
async fn missing_tool_fails_before_any_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());

    let mut cfg = config(dir.path());
    cfg.required_tools = vec!["tandem-test-no-such-tool".to_string()];
    let sup = Supervisor::new(cfg, parts(&world, store.clone()));

    let err = sup.start().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::ToolMissing { .. }));
    assert_eq!(err.step(), "validate environment");
    assert!(world.launches().is_empty());
    assert!(world.signals().is_empty());
    assert!(store.is_empty());
    assert!(!dir.path().join(".env").exists());
    assert!(!dir.path().join(".tandem/events.jsonl").exists());
}

#[tokio::test]
async fn separate_invocation_stops_via_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let run_dir: PathBuf = dir.path().join(".tandem/run");

    let starter = supervisor(dir.path(), &world, Arc::new(FileStore::new(&run_dir)));
    let (backend, frontend) = started(starter.start().await.unwrap());
    drop(starter);

    let stopper = supervisor(dir.path(), &world, Arc::new(FileStore::new(&run_dir)));
    let report = stopper.stop().await.unwrap();

    assert!(report.was_running());
    let mut pids: Vec<u32> = report.tiers.iter().map(|t| t.pid).collect();
    pids.sort_unstable();
    assert_eq!(pids, vec![backend.pid, frontend.pid]);
    assert!(!run_dir.join("backend.pid").exists());
    assert!(!run_dir.join("frontend.pid").exists());
}

#[tokio::test]
async fn status_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new();
    let store = Arc::new(MemoryStore::new());
    let sup = supervisor(dir.path(), &world, store.clone());
    sup.start().await.unwrap();
    let signals_before = world.signals().len();

    let status = sup.status().await.unwrap();

    assert_eq!(status.tiers.len(), 2);
    assert_eq!(world.signals().len(), signals_before);
    assert_eq!(store.len(), 2);
    assert!(status
        .recent_events
        .iter()
        .any(|e| e.event_type == "running"));
}
