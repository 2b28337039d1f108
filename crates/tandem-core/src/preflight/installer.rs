//! Dependency installer - materialise a tier's dependencies once.

use tokio::process::Command;

use crate::config::ServiceSpec;
use crate::error::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Tier declares no install step.
    NotConfigured,
    /// Marker already present.
    Skipped,
    Installed,
    /// Install step failed; launch proceeds anyway.
    Failed { reason: String },
}

/// Runs a tier's install command unless its marker path exists.
///
/// Failures are soft: a previously provisioned environment may still run
/// the tier even when re-installing fails (offline re-run, for example).
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyInstaller;

impl DependencyInstaller {
    pub fn new() -> Self {
        Self
    }

    pub async fn ensure(&self, spec: &ServiceSpec) -> InstallOutcome {
        let Some(install) = &spec.install else {
            return InstallOutcome::NotConfigured;
        };

        if install.marker.exists() {
            tracing::debug!(
                tier = %spec.name,
                marker = %install.marker.display(),
                "Dependencies already installed"
            );
            return InstallOutcome::Skipped;
        }

        tracing::info!(tier = %spec.name, command = %install.command, "Installing dependencies");

        let result = Command::new("sh")
            .arg("-c")
            .arg(&install.command)
            .current_dir(&spec.working_dir)
            .output()
            .await;

        let reason = match result {
            Ok(output) if output.status.success() => {
                if !install.marker.exists() {
                    if let Err(e) = stamp(&install.marker) {
                        tracing::debug!(marker = %install.marker.display(), error = %e, "Could not write install marker");
                    }
                }
                tracing::info!(tier = %spec.name, "Dependencies installed");
                return InstallOutcome::Installed;
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                format!("{} {}", output.status, tail.join(" | "))
            }
            Err(e) => e.to_string(),
        };

        let warning = OrchestratorError::DependencyInstallFailure {
            tier: spec.name.clone(),
            reason: reason.clone(),
        };
        tracing::warn!(error = %warning, "Continuing to launch anyway");
        InstallOutcome::Failed { reason }
    }
}

fn stamp(marker: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(marker, chrono::Utc::now().to_rfc3339())
}
