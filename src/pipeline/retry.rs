//! Retry policy and pacing.
//!
//! Foundation:
//! - K_i: Attempts are bounded; pauses between them are fixed or doubling
//! - B_i: An attempt may fail → retried only while the error is retryable
//! - I^B: Uniform request timing looks automated → jittered inter-row pause

use crate::models::{Backoff, Result, RunConfig};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Cap for exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded retry with a fixed or exponential pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    /// Pause after the first failed attempt
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff,
        }
    }

    /// Policy for row submission attempts.
    pub fn for_rows(config: &RunConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_delay_ms),
            config.backoff,
        )
    }

    /// Pause to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor).min(MAX_BACKOFF)
            }
        }
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `op` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.allows_retry_after(attempt) => {
                    let pause = self.delay_after(attempt);
                    debug!(
                        op = label,
                        attempt = attempt,
                        pause_ms = pause.as_millis() as u64,
                        error = %e,
                        "Retrying"
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Random pause in `[min_ms, max_ms]` between successful rows.
pub fn jittered_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(fastrand::u64(min_ms..=max_ms))
}
