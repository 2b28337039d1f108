//! Preflight - everything that runs before the first tier is launched.

mod bootstrap;
mod installer;
mod validator;

pub use bootstrap::{Acknowledge, AutoAcknowledge, BootstrapOutcome, Bootstrapper, TerminalPrompt};
pub use installer::{DependencyInstaller, InstallOutcome};
pub use validator::{find_in_path, EnvironmentValidator};
