//! Process control - launching tiers, signalling them, reclaiming ports.

mod launcher;
mod ports;
mod signal;

pub use launcher::{Launch, ProcessLauncher};
pub use ports::{LsofInspector, PortInspector, PortReconciler, ReconcileOutcome};
pub use signal::{terminate, Signal, SignalScope, Signaller, SystemSignaller, TerminateOutcome};
