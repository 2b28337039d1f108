//! Interrupt handling for the supervisory wait.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Guards the teardown path so it runs at most once per process.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    is_shutting_down: AtomicBool,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only.
    pub fn begin(&self) -> bool {
        self.is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
///
/// Only the first signal cancels; later ones are logged and otherwise
/// ignored so an in-flight teardown is not interrupted.
pub fn listen_for_signals(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let signal = match next_signal().await {
                Some(signal) => signal,
                None => return,
            };
            if token.is_cancelled() {
                tracing::warn!(signal, "Shutdown already in progress");
            } else {
                tracing::info!(signal, "Shutdown requested");
                token.cancel();
            }
        }
    })
}

#[cfg(unix)]
async fn next_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::debug!(error = %e, "SIGTERM handler unavailable");
            return tokio::signal::ctrl_c().await.ok().map(|_| "SIGINT");
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.ok().map(|_| "SIGINT"),
        _ = sigterm.recv() => Some("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Option<&'static str> {
    tokio::signal::ctrl_c().await.ok().map(|_| "ctrl-c")
}
