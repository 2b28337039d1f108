//! Error taxonomy for the orchestration run.

use std::path::PathBuf;

use thiserror::Error;

/// Failures the orchestrator can observe.
///
/// Soft variants (`ConfigMissing`, `DependencyInstallFailure`,
/// `PortReclaimFailure`) are logged and the run continues; the others abort
/// the run and trigger rollback of tiers started by it.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("required tools not found on PATH: {}", tools.join(", "))]
    ToolMissing { tools: Vec<String> },

    #[error("settings file {} is missing and no template is available", path.display())]
    ConfigMissing { path: PathBuf },

    #[error("dependency install for {tier} failed: {reason}")]
    DependencyInstallFailure { tier: String, reason: String },

    #[error("port {port} is still held by pid(s) {pids:?}")]
    PortReclaimFailure { port: u16, pids: Vec<u32> },

    #[error("failed to launch {tier}: {source}")]
    TierLaunchFailure {
        tier: String,
        log: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("{tier} did not become ready after {attempts} attempts")]
    HealthTimeout {
        tier: String,
        attempts: u32,
        log: Option<PathBuf>,
    },

    /// The launched process died before its probe passed, typically because
    /// its port was still held and the bind failed.
    #[error("{tier} (pid {pid}) exited before becoming ready")]
    TierExited {
        tier: String,
        pid: u32,
        log: Option<PathBuf>,
    },

    #[error("lifecycle store error at {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Orchestration step the failure belongs to.
    pub fn step(&self) -> &'static str {
        match self {
            Self::ToolMissing { .. } => "validate environment",
            Self::ConfigMissing { .. } => "bootstrap settings",
            Self::DependencyInstallFailure { .. } => "install dependencies",
            Self::PortReclaimFailure { .. } => "reconcile ports",
            Self::TierLaunchFailure { .. } => "launch tier",
            Self::HealthTimeout { .. } | Self::TierExited { .. } => "health gate",
            Self::Store { .. } => "lifecycle store",
            Self::Io(_) => "io",
        }
    }

    /// Log sink worth pointing the user at, if any.
    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Self::TierLaunchFailure { log, .. }
            | Self::HealthTimeout { log, .. }
            | Self::TierExited { log, .. } => log.as_ref(),
            _ => None,
        }
    }

    /// Whether this failure aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ConfigMissing { .. }
                | Self::DependencyInstallFailure { .. }
                | Self::PortReclaimFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
