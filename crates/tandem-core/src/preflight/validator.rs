//! Environment validator - required tool runtimes must be on PATH.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Checks that every required tool resolves on a search path.
pub struct EnvironmentValidator {
    tools: Vec<String>,
    search_path: Option<OsString>,
}

impl EnvironmentValidator {
    /// Validator over the process `PATH`.
    pub fn new(tools: &[String]) -> Self {
        Self {
            tools: tools.to_vec(),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Validator over an explicit search path.
    pub fn with_search_path(tools: &[String], search_path: impl Into<OsString>) -> Self {
        Self {
            tools: tools.to_vec(),
            search_path: Some(search_path.into()),
        }
    }

    /// Fails with every missing tool named, before anything is mutated.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<String> = self
            .tools
            .iter()
            .filter(|tool| {
                let found = self
                    .search_path
                    .as_ref()
                    .and_then(|path| find_in_path(tool, path));
                match &found {
                    Some(location) => {
                        tracing::debug!(tool = %tool, path = %location.display(), "Found tool");
                    }
                    None => tracing::error!(tool = %tool, "Required tool not found"),
                }
                found.is_none()
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::ToolMissing { tools: missing })
        }
    }
}

/// Locate an executable named `tool` on `search_path`.
pub fn find_in_path(tool: &str, search_path: &std::ffi::OsStr) -> Option<PathBuf> {
    if tool.contains(std::path::MAIN_SEPARATOR) {
        let candidate = PathBuf::from(tool);
        return is_executable(&candidate).then_some(candidate);
    }

    std::env::split_paths(search_path)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
