//! Real child processes: launch, liveness, group termination.
#![cfg(unix)]

use std::time::Duration;

use tandem_core::config::ServiceSpec;
use tandem_core::process::{
    terminate, Launch, ProcessLauncher, SignalScope, Signaller, SystemSignaller, TerminateOutcome,
};
use tandem_core::retry::TokioClock;
use tandem_core::state::{FileStore, LifecycleStore};

fn spec(dir: &std::path::Path, command: &str) -> ServiceSpec {
    let mut spec = ServiceSpec::backend();
    spec.command = command.to_string();
    spec.working_dir = dir.to_path_buf();
    spec.log_file = Some(dir.join("logs/api.log"));
    spec.install = None;
    spec
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn launched_tier_writes_to_its_log_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec(dir.path(), "echo \"listening on $PORT\"; exec sleep 30");

    let handle = ProcessLauncher::new().launch(&spec).unwrap();
    let signaller = SystemSignaller;
    assert!(signaller.is_alive(handle.pid));

    let log = dir.path().join("logs/api.log");
    assert!(
        wait_for(|| std::fs::read_to_string(&log)
            .map(|s| s.contains("listening on 8001"))
            .unwrap_or(false))
        .await
    );
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.starts_with("--- tandem: starting backend on port 8001"));

    let outcome = terminate(
        &signaller,
        &TokioClock,
        handle.pid,
        SignalScope::Group,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(outcome, TerminateOutcome::Exited);
    assert!(!signaller.is_alive(handle.pid));
}

#[tokio::test]
async fn group_termination_reaches_grandchildren() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let handle = ProcessLauncher::new().launch(&spec(dir.path(), &command)).unwrap();
    assert!(wait_for(|| pid_file.exists()).await);
    let grandchild: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    let signaller = SystemSignaller;
    terminate(
        &signaller,
        &TokioClock,
        handle.pid,
        SignalScope::Group,
        Duration::from_secs(5),
    )
    .await;

    // Not our child: once orphaned it may linger as a zombie until init reaps it.
    let gone = wait_for(|| {
        let missing = unsafe { libc::kill(grandchild, 0) } == -1;
        let zombie = std::fs::read_to_string(format!("/proc/{grandchild}/stat"))
            .map(|stat| stat.contains(") Z "))
            .unwrap_or(false);
        missing || zombie
    })
    .await;
    assert!(gone);
}

#[tokio::test]
async fn missing_working_dir_is_a_launch_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec(dir.path(), "sleep 30");
    spec.working_dir = dir.path().join("does-not-exist");

    let err = ProcessLauncher::new().launch(&spec).unwrap_err();

    assert_eq!(err.step(), "launch tier");
    assert_eq!(err.log_path().cloned(), Some(dir.path().join("logs/api.log")));
}

#[tokio::test]
async fn file_store_round_trips_a_real_pid() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("run"));
    let handle = ProcessLauncher::new()
        .launch(&spec(dir.path(), "exec sleep 30"))
        .unwrap();

    store.put(&handle).unwrap();
    let loaded = store.get("backend").unwrap().unwrap();
    assert_eq!(loaded.pid, handle.pid);

    let signaller = SystemSignaller;
    terminate(
        &signaller,
        &TokioClock,
        loaded.pid,
        SignalScope::Group,
        Duration::from_secs(5),
    )
    .await;
    store.clear("backend").unwrap();
    assert!(store.get("backend").unwrap().is_none());
}
