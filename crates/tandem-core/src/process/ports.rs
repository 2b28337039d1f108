//! Port reconciler - frees a port held by a stale listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::signal::{Signal, SignalScope, Signaller};
use crate::error::{OrchestratorError, Result};
use crate::retry::Clock;

/// Answers "which processes are listening on this port?".
#[async_trait]
pub trait PortInspector: Send + Sync {
    async fn listeners(&self, port: u16) -> std::io::Result<Vec<u32>>;
}

/// Uses `lsof -t` to list listening pids.
#[derive(Debug, Default, Clone, Copy)]
pub struct LsofInspector;

#[async_trait]
impl PortInspector for LsofInspector {
    async fn listeners(&self, port: u16) -> std::io::Result<Vec<u32>> {
        let output = Command::new("lsof")
            .args(["-nP", "-t"])
            .arg(format!("-iTCP:{port}"))
            .arg("-sTCP:LISTEN")
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // lsof exits 1 with empty output when nothing matches.
        if !output.status.success() && stdout.trim().is_empty() && !stderr.trim().is_empty() {
            return Err(std::io::Error::other(format!("lsof failed: {}", stderr.trim())));
        }

        let mut pids: Vec<u32> = stdout
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nobody was listening.
    Free,
    /// Listeners were terminated; `forced` when SIGKILL was needed.
    Reclaimed { pids: Vec<u32>, forced: bool },
}

/// Two-phase (graceful, then forced) reclamation of a port.
pub struct PortReconciler {
    inspector: Arc<dyn PortInspector>,
    signaller: Arc<dyn Signaller>,
    clock: Arc<dyn Clock>,
    settle: Duration,
    inspection_failed: AtomicBool,
}

impl PortReconciler {
    pub fn new(
        inspector: Arc<dyn PortInspector>,
        signaller: Arc<dyn Signaller>,
        clock: Arc<dyn Clock>,
        settle: Duration,
    ) -> Self {
        Self {
            inspector,
            signaller,
            clock,
            settle,
            inspection_failed: AtomicBool::new(false),
        }
    }

    /// True once the inspector has failed (for example `lsof` is not installed).
    pub fn inspection_unavailable(&self) -> bool {
        self.inspection_failed.load(Ordering::Relaxed)
    }

    async fn owners(&self, port: u16) -> Result<Vec<u32>> {
        let own = std::process::id();
        match self.inspector.listeners(port).await {
            Ok(pids) => Ok(pids.into_iter().filter(|pid| *pid != own).collect()),
            Err(e) => {
                if self.inspection_failed.swap(true, Ordering::Relaxed) {
                    tracing::debug!(port, error = %e, "Could not inspect port");
                } else {
                    tracing::warn!(
                        port,
                        error = %e,
                        "Could not inspect listening ports; stale listeners will not be reclaimed"
                    );
                }
                Err(OrchestratorError::PortReclaimFailure {
                    port,
                    pids: Vec::new(),
                })
            }
        }
    }

    fn send_all(&self, pids: &[u32], signal: Signal) {
        for &pid in pids {
            if let Err(e) = self.signaller.signal(pid, signal, SignalScope::Process) {
                tracing::debug!(pid, ?signal, error = %e, "Signal delivery failed");
            }
        }
    }

    /// Free `port`. Failure is soft: callers log it and let the subsequent
    /// bind be the authoritative signal.
    pub async fn reconcile(&self, port: u16) -> Result<ReconcileOutcome> {
        let pids = self.owners(port).await?;
        if pids.is_empty() {
            tracing::debug!(port, "Port is free");
            return Ok(ReconcileOutcome::Free);
        }

        tracing::info!(port, ?pids, "Port in use, asking owner(s) to exit");
        self.send_all(&pids, Signal::Terminate);
        self.clock.sleep(self.settle).await;

        let remaining = self.owners(port).await?;
        if remaining.is_empty() {
            tracing::info!(port, "Port reclaimed");
            return Ok(ReconcileOutcome::Reclaimed {
                pids,
                forced: false,
            });
        }

        tracing::warn!(port, pids = ?remaining, "Port still held, forcing");
        self.send_all(&remaining, Signal::Kill);
        self.clock.sleep(self.settle).await;

        let remaining = self.owners(port).await?;
        if remaining.is_empty() {
            tracing::info!(port, "Port reclaimed after SIGKILL");
            Ok(ReconcileOutcome::Reclaimed { pids, forced: true })
        } else {
            Err(OrchestratorError::PortReclaimFailure {
                port,
                pids: remaining,
            })
        }
    }
}
