//! Health gate - bounded readiness polling for a freshly launched tier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::{ProbeSpec, ServiceSpec};
use crate::error::{OrchestratorError, Result};
use crate::process::Signaller;
use crate::retry::{Clock, PollOutcome, RetryPolicy};
use crate::state::ProcessHandle;

/// One readiness check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// `Ok` when the tier is reachable, `Err` with a transport-level reason otherwise.
    async fn check(&self, probe: &ProbeSpec, timeout: Duration) -> std::result::Result<(), String>;
}

/// HTTP and TCP reachability checks.
///
/// Any HTTP response is accepted as ready, including 4xx/5xx: a tier that
/// answers at all is serving, possibly degraded.
#[derive(Debug, Clone, Default)]
pub struct NetworkProbe {
    client: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Probe for NetworkProbe {
    async fn check(&self, probe: &ProbeSpec, timeout: Duration) -> std::result::Result<(), String> {
        match probe {
            ProbeSpec::Http { url } => {
                let response = self
                    .client
                    .get(url)
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                tracing::trace!(url = %url, status = %response.status(), "Probe answered");
                Ok(())
            }
            ProbeSpec::Tcp { address } => {
                match tokio::time::timeout(timeout, TcpStream::connect(address.as_str())).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("connect to {address} timed out")),
                }
            }
        }
    }
}

/// Polls a tier's probe until it answers or its window runs out.
///
/// A probe answer only counts while the launched process is still alive:
/// a tier that lost its bind to a leftover listener must not be reported
/// ready on that listener's behalf.
pub struct HealthGate {
    probe: Arc<dyn Probe>,
    signaller: Arc<dyn Signaller>,
    clock: Arc<dyn Clock>,
}

impl HealthGate {
    pub fn new(probe: Arc<dyn Probe>, signaller: Arc<dyn Signaller>, clock: Arc<dyn Clock>) -> Self {
        Self {
            probe,
            signaller,
            clock,
        }
    }

    /// Block until `spec` is reachable; returns the number of attempts used.
    ///
    /// Fails early with `TierExited` once the launched process is gone.
    pub async fn wait_ready(&self, spec: &ServiceSpec, handle: &ProcessHandle) -> Result<u32> {
        let target = spec.resolved_probe();
        let timeout = spec.health.probe_timeout();
        let policy = RetryPolicy::new(spec.health.attempts, spec.health.interval());

        tracing::info!(
            tier = %spec.name,
            pid = handle.pid,
            target = %target.target(),
            attempts = policy.attempts,
            "Waiting for tier to become ready"
        );

        let probe = self.probe.as_ref();
        let signaller = self.signaller.as_ref();
        let pid = handle.pid;
        let exited = AtomicBool::new(false);
        let exited_ref = &exited;
        let target_ref = &target;
        let name = spec.name.as_str();
        let outcome = policy
            .poll(self.clock.as_ref(), |n| async move {
                if !signaller.is_alive(pid) {
                    exited_ref.store(true, Ordering::Relaxed);
                    return true;
                }
                match probe.check(target_ref, timeout).await {
                    Ok(()) => {
                        if !signaller.is_alive(pid) {
                            exited_ref.store(true, Ordering::Relaxed);
                        }
                        true
                    }
                    Err(reason) => {
                        tracing::debug!(tier = %name, attempt = n, %reason, "Not ready yet");
                        false
                    }
                }
            })
            .await;

        if exited.load(Ordering::Relaxed) {
            tracing::warn!(tier = %spec.name, pid, "Tier exited before becoming ready");
            return Err(OrchestratorError::TierExited {
                tier: spec.name.clone(),
                pid,
                log: spec.log_file.clone(),
            });
        }

        match outcome {
            PollOutcome::Ready { attempts } => {
                tracing::info!(tier = %spec.name, attempts, "Tier is ready");
                Ok(attempts)
            }
            PollOutcome::TimedOut { attempts } => Err(OrchestratorError::HealthTimeout {
                tier: spec.name.clone(),
                attempts,
                log: spec.log_file.clone(),
            }),
        }
    }

    /// Single probe, no retries.
    pub async fn is_ready(&self, spec: &ServiceSpec) -> bool {
        self.probe
            .check(&spec.resolved_probe(), spec.health.probe_timeout())
            .await
            .is_ok()
    }
}
