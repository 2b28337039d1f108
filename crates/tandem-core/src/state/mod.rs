//! Lifecycle state - process handles and their persistence.

mod handle;
mod store;

pub use handle::{OrchestrationState, ProcessHandle, TierState};
pub use store::{FileStore, LifecycleStore, MemoryStore};
