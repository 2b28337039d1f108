//! Signalling and liveness checks for OS processes.

use std::time::Duration;

use crate::retry::Clock;

/// Liveness poll interval while waiting for a signalled process to exit.
const EXIT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to shut down (SIGTERM).
    Terminate,
    /// Force it (SIGKILL).
    Kill,
}

/// What a signal is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    /// Only the pid itself.
    Process,
    /// The process group the pid leads; tiers are launched as group leaders
    /// so their shell wrapper and its children go down together.
    Group,
}

/// Sends signals and answers "is this pid still running?".
pub trait Signaller: Send + Sync {
    fn signal(&self, pid: u32, signal: Signal, scope: SignalScope) -> std::io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// `kill(2)`-backed signaller.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSignaller;

#[cfg(unix)]
impl Signaller for SystemSignaller {
    fn signal(&self, pid: u32, signal: Signal, scope: SignalScope) -> std::io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|p| *p > 1)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "refusing to signal pid"))?;
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };

        if scope == SignalScope::Group {
            // SAFETY: kill has no memory-safety preconditions.
            if unsafe { libc::kill(-pid, sig) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
            // Not a group leader (anymore); fall back to the pid itself.
        }

        // SAFETY: as above.
        if unsafe { libc::kill(pid, sig) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }

        // Reap it first if it is an exited child of ours, otherwise the
        // zombie would still answer kill(pid, 0).
        let mut status: libc::c_int = 0;
        // SAFETY: status points to a live c_int.
        if unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } == pid {
            return false;
        }

        // SAFETY: signal 0 only performs the permission/existence check.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
impl Signaller for SystemSignaller {
    fn signal(&self, _pid: u32, _signal: Signal, _scope: SignalScope) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process signalling is only supported on unix",
        ))
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Nothing was running under that pid.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Exited,
    /// Needed SIGKILL.
    Killed,
    /// Still alive after SIGKILL.
    Survived,
}

impl TerminateOutcome {
    pub fn is_gone(&self) -> bool {
        !matches!(self, Self::Survived)
    }
}

/// Graceful termination with escalation: SIGTERM, wait up to `grace`, SIGKILL.
pub async fn terminate(
    signaller: &dyn Signaller,
    clock: &dyn Clock,
    pid: u32,
    scope: SignalScope,
    grace: Duration,
) -> TerminateOutcome {
    if !signaller.is_alive(pid) {
        return TerminateOutcome::AlreadyExited;
    }

    if let Err(e) = signaller.signal(pid, Signal::Terminate, scope) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
        if !signaller.is_alive(pid) {
            return TerminateOutcome::AlreadyExited;
        }
    }

    let polls = (grace.as_millis() / EXIT_POLL.as_millis()).max(1);
    for _ in 0..polls {
        clock.sleep(EXIT_POLL).await;
        if !signaller.is_alive(pid) {
            return TerminateOutcome::Exited;
        }
    }

    tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, sending SIGKILL");
    if let Err(e) = signaller.signal(pid, Signal::Kill, scope) {
        tracing::debug!(pid, error = %e, "SIGKILL failed");
    }
    clock.sleep(EXIT_POLL).await;

    if signaller.is_alive(pid) {
        TerminateOutcome::Survived
    } else {
        TerminateOutcome::Killed
    }
}
