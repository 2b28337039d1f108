//! Settings bootstrapper - make sure the tiers' settings file exists.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Lets the user look at a freshly seeded settings file before continuing.
pub trait Acknowledge: Send + Sync {
    fn acknowledge(&self, settings: &Path) -> std::io::Result<()>;
}

/// Blocks on Enter from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl Acknowledge for TerminalPrompt {
    fn acknowledge(&self, settings: &Path) -> std::io::Result<()> {
        let mut stderr = std::io::stderr();
        writeln!(stderr)?;
        writeln!(stderr, "Created {} from its template.", settings.display())?;
        writeln!(stderr, "Fill in any API keys the tiers need, then press Enter to continue.")?;
        stderr.flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(())
    }
}

/// Non-interactive contexts: continue immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcknowledge;

impl Acknowledge for AutoAcknowledge {
    fn acknowledge(&self, settings: &Path) -> std::io::Result<()> {
        tracing::info!(path = %settings.display(), "Seeded settings file; not waiting for edits");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Settings file already existed.
    Present,
    /// Copied from the template.
    Seeded { template: PathBuf },
    /// Neither file exists; tiers run without it.
    Missing,
}

/// Seeds the settings file from its template when absent. Idempotent.
pub struct Bootstrapper {
    settings: PathBuf,
    template: Option<PathBuf>,
}

impl Bootstrapper {
    pub fn new(settings: impl Into<PathBuf>, template: Option<PathBuf>) -> Self {
        Self {
            settings: settings.into(),
            template,
        }
    }

    pub fn ensure(&self, ack: &dyn Acknowledge) -> Result<BootstrapOutcome> {
        if self.settings.exists() {
            tracing::debug!(path = %self.settings.display(), "Settings file present");
            return Ok(BootstrapOutcome::Present);
        }

        let Some(template) = self.template.as_ref().filter(|t| t.exists()) else {
            let warning = OrchestratorError::ConfigMissing {
                path: self.settings.clone(),
            };
            tracing::warn!(error = %warning, "Continuing without settings file");
            return Ok(BootstrapOutcome::Missing);
        };

        if let Some(parent) = self.settings.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(template, &self.settings)?;
        tracing::info!(
            from = %template.display(),
            to = %self.settings.display(),
            "Seeded settings file from template"
        );

        ack.acknowledge(&self.settings)?;

        Ok(BootstrapOutcome::Seeded {
            template: template.clone(),
        })
    }
}
