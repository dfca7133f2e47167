//! Bounded retry with exponential backoff, and per-call deadlines.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{BackendKind, Error, Result};

/// Retry policy for backend calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// Delay before the first retry (doubles each attempt)
    pub initial_backoff: Duration,
    /// Maximum delay cap
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// `min(initial_backoff * 2^attempt, max_backoff)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

/// Whether an HTTP status is worth retrying: rate limits and server errors.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Run `op` until it succeeds, fails permanently, or runs out of retries.
///
/// Only errors with [`Error::is_transient`] are retried. Cancellation is
/// observed during the call and during backoff sleeps.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_loop(policy, cancel, label, true, op).await
}

/// [`with_retry`] for work whose in-flight call must not be torn down.
///
/// A call already running when `cancel` fires is allowed to finish; its
/// result is discarded and no further attempt starts. Backoff sleeps are
/// still interrupted.
pub async fn with_retry_detached<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_loop(policy, cancel, label, false, op).await
}

async fn retry_loop<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    interrupt_call: bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        cancel.check()?;
        let result = if interrupt_call {
            tokio::select! {
                r = op() => r,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        } else {
            let r = op().await;
            cancel.check()?;
            r
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    op = label,
                    attempt,
                    max = policy.max_retries,
                    ?delay,
                    "transient failure, retrying: {e}"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bound `fut` by `after`, reporting expiry as a transient backend timeout.
pub async fn with_timeout<T>(
    backend: BackendKind,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::BackendTimeout { backend, after }),
    }
}
