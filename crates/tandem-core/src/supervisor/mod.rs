//! Supervisor - drives the two tiers through their lifecycle.

mod orchestrator;
mod reporter;
mod shutdown;

pub use orchestrator::{
    Collaborators, RunPhase, StartReport, StatusReport, StopReport, Supervisor, TierStop,
};
pub use reporter::{LogOptions, LogOutcome, LogReporter};
pub use shutdown::{listen_for_signals, ShutdownLatch};
