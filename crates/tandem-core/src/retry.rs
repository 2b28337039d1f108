//! Bounded retry with an injectable sleep source.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// Source of suspension for every wait the orchestrator performs.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Result of a bounded polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Up to `attempts` tries, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Run `attempt` until it returns true or the window is exhausted.
    ///
    /// The closure receives the 1-based attempt number. No sleep follows the
    /// final attempt.
    pub async fn poll<F, Fut>(&self, clock: &dyn Clock, mut attempt: F) -> PollOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        for n in 1..=self.attempts {
            if attempt(n).await {
                return PollOutcome::Ready { attempts: n };
            }
            if n < self.attempts {
                clock.sleep(self.interval).await;
            }
        }
        PollOutcome::TimedOut {
            attempts: self.attempts,
        }
    }
}
