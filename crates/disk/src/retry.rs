use std::future::Future;
use std::time::Duration;

use tierstore_common::settings::Backoff;
use tierstore_common::TierError;
use tracing::warn;

/// Bounded retry schedule for one logical remote call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Fixed { delay_ms: 0 })
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let ms = (initial_ms as f64) * multiplier.max(1.0).powi(exp);
                Duration::from_millis(ms.min(max_ms as f64) as u64)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Exhaustion surfaces as `IoFailure`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TierError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TierError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= self.max_attempts {
                        return Err(TierError::IoFailure {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        op = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
