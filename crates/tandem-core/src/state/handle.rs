//! Process handle model and the derived orchestration state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// "This orchestrator started this pid at this time."
///
/// A stored handle says nothing about whether the process is still alive;
/// check liveness before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub service: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(service: impl Into<String>, pid: u32) -> Self {
        Self {
            service: service.into(),
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Observed state of one tier, recomputed on every query.
#[derive(Debug, Clone, Serialize)]
pub struct TierState {
    pub name: String,
    pub port: u16,
    pub handle: Option<ProcessHandle>,
    /// Stored pid exists and the process answers a liveness check
    pub alive: bool,
    /// Readiness probe succeeded
    pub reachable: bool,
}

impl TierState {
    /// Handle is present, alive and the tier answers its probe.
    pub fn is_valid(&self) -> bool {
        self.handle.is_some() && self.alive && self.reachable
    }
}

/// The (backend valid?, frontend valid?) pair, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationState {
    Running,
    Partial,
    Stopped,
}

impl OrchestrationState {
    pub fn derive(backend: &TierState, frontend: &TierState) -> Self {
        match (backend.is_valid(), frontend.is_valid()) {
            (true, true) => Self::Running,
            (false, false) => Self::Stopped,
            _ => Self::Partial,
        }
    }
}
