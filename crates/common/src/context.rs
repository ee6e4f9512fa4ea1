use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::TierError;

/// Caller-supplied bounds for one engine operation: an optional deadline and a
/// cancellation token. Racing an operation against these drops its future on
/// abort, which stops any backoff sleep or retry in flight.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OpContext {
    /// No deadline, never cancelled unless `cancel_token()` is triggered.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Share an existing token (e.g. a table-wide shutdown token).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if the context is already spent.
    pub fn check(&self) -> Result<(), TierError> {
        if self.cancel.is_cancelled() {
            return Err(TierError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(TierError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the deadline passes or the token fires.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TierError>
    where
        F: Future<Output = Result<T, TierError>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                res = fut => res,
                _ = tokio::time::sleep_until(deadline) => Err(TierError::DeadlineExceeded),
                _ = self.cancel.cancelled() => Err(TierError::Cancelled),
            },
            None => tokio::select! {
                res = fut => res,
                _ = self.cancel.cancelled() => Err(TierError::Cancelled),
            },
        }
    }
}
