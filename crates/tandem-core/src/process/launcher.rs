//! Launcher - starts a tier as a detached background process.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Stdio};

use chrono::Utc;

use crate::config::ServiceSpec;
use crate::error::{OrchestratorError, Result};
use crate::state::ProcessHandle;

/// Creates tier processes.
///
/// The returned handle reflects process creation, not readiness.
pub trait Launch: Send + Sync {
    fn launch(&self, spec: &ServiceSpec) -> Result<ProcessHandle>;
}

/// Spawns `sh -c <command>` in its own session with output sent to the
/// tier's log sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    fn output_sinks(spec: &ServiceSpec) -> std::io::Result<(Stdio, Stdio)> {
        let Some(path) = &spec.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(
            file,
            "--- tandem: starting {} on port {} at {} ---",
            spec.name,
            spec.port,
            Utc::now().to_rfc3339()
        )?;
        let stderr = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

impl Launch for ProcessLauncher {
    fn launch(&self, spec: &ServiceSpec) -> Result<ProcessHandle> {
        let failure = |source: std::io::Error| OrchestratorError::TierLaunchFailure {
            tier: spec.name.clone(),
            log: spec.log_file.clone(),
            source,
        };

        let (stdout, stderr) = Self::output_sinks(spec).map_err(failure)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .env("PORT", spec.port.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(failure)?;
        let handle = ProcessHandle::new(&spec.name, child.id());

        tracing::info!(
            tier = %spec.name,
            pid = handle.pid,
            port = spec.port,
            command = %spec.command,
            "Launched tier"
        );

        // Dropping the Child neither kills nor waits; liveness checks reap it.
        drop(child);
        Ok(handle)
    }
}
