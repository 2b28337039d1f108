//! Tandem Core - local two-tier service orchestrator
//!
//! This crate brings up a backend API process and the frontend web process
//! that depends on it, gates each on an observed readiness probe, records
//! their pids so a later invocation can find them, and tears the pair down
//! on request or interrupt.

pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod state;
pub mod supervisor;

pub use config::{OrchestratorConfig, ProbeSpec, ServiceSpec};
pub use error::OrchestratorError;
pub use health::{HealthGate, NetworkProbe, Probe};
pub use retry::{Clock, PollOutcome, RetryPolicy, TokioClock};
pub use state::{FileStore, LifecycleStore, MemoryStore, ProcessHandle};
pub use supervisor::{Collaborators, StartReport, StopReport, Supervisor};
