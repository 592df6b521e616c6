//! Retry policy and the exponential-backoff dispatcher.
//!
//! [`RetryDispatcher`] holds no record identity: it runs whatever closure it
//! is given under a [`RetryPolicy`], asking a caller-supplied `classify`
//! function whether each failure is terminal or worth another attempt.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorClass;
use crate::{MealSyncError, telemetry};

/// Configuration for retry behaviour on transient errors.
///
/// ```rust
/// # use mealsync::RetryPolicy;
/// # use std::time::Duration;
/// let policy = RetryPolicy::new()
///     .max_attempts(8)
///     .initial_delay(Duration::from_millis(250));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    /// 1 = no retry. Default: 5.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 500ms.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
    /// Minimum delay after a rate-limit signal without a `Retry-After` hint.
    /// Default: 2s.
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            rate_limit_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, no retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the first). Values below 1 are treated as 1.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    /// Backoff after the failed attempt `attempt` (0-indexed).
    ///
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Delay to wait after a failure of class `class` on attempt `attempt`.
    ///
    /// Rate limits wait at least the server hint (or `rate_limit_delay`
    /// when there is none), still capped at `max_delay`.
    pub fn effective_delay(&self, attempt: u32, class: ErrorClass) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match class {
            ErrorClass::RateLimited { retry_after } => backoff
                .max(retry_after.unwrap_or(self.rate_limit_delay))
                .min(self.max_delay),
            _ => backoff,
        }
    }
}

/// Why [`RetryDispatcher::execute`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// `classify` returned [`ErrorClass::Terminal`].
    #[error("{error}")]
    Terminal { attempts: u32, error: E },
    /// Every attempt failed with a retryable error; `last` is the final one.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The cancellation token fired between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Terminal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The last underlying error, if any attempt ran.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Terminal { error, .. } => Some(error),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

impl From<RetryError<MealSyncError>> for MealSyncError {
    fn from(err: RetryError<MealSyncError>) -> Self {
        match err {
            RetryError::Terminal { error, .. } => error,
            RetryError::Exhausted { attempts, last } => MealSyncError::Exhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Cancelled { .. } => MealSyncError::Cancelled,
        }
    }
}

/// Stateless exponential-backoff executor.
///
/// Each call to [`execute`](Self::execute) is an independent loop; backoff
/// sleeps are async and never block other in-flight work.
#[derive(Debug, Clone, Default)]
pub struct RetryDispatcher {
    policy: RetryPolicy,
}

impl RetryDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails terminally, or runs out of attempts.
    ///
    /// `operation_name` labels logs and metrics.
    pub async fn execute<F, Fut, T, E, C>(
        &self,
        operation_name: &str,
        operation: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        C: Fn(&E) -> ErrorClass,
    {
        self.execute_cancellable(operation_name, &CancellationToken::new(), operation, classify)
            .await
    }

    /// Like [`execute`](Self::execute), but stops before the next attempt once
    /// `cancel` fires. An attempt already running is allowed to finish.
    pub async fn execute_cancellable<F, Fut, T, E, C>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        C: Fn(&E) -> ErrorClass,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = None;
        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last,
                });
            }
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = classify(&err);
            if class == ErrorClass::Terminal {
                return Err(RetryError::Terminal {
                    attempts: attempt + 1,
                    error: err,
                });
            }

            if attempt + 1 < max_attempts {
                let delay = self.policy.effective_delay(attempt, class);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                metrics::counter!(telemetry::RETRIES_TOTAL,
                    "operation" => operation_name.to_owned(),
                )
                .increment(1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled {
                            attempts: attempt + 1,
                            last: Some(err),
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            last = Some(err);
        }

        match last {
            Some(last) => Err(RetryError::Exhausted {
                attempts: max_attempts,
                last,
            }),
            None => Err(RetryError::Cancelled {
                attempts: max_attempts,
                last: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::new().initial_delay(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn rate_limit_uses_longer_of_hint_and_backoff() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_millis(100))
            .rate_limit_delay(Duration::from_secs(1));
        let no_hint = ErrorClass::RateLimited { retry_after: None };
        assert_eq!(policy.effective_delay(0, no_hint), Duration::from_secs(1));

        let hinted = ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(policy.effective_delay(0, hinted), Duration::from_secs(3));

        let huge = ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(policy.effective_delay(0, huge), policy.max_delay);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new().max_attempts(0).max_attempts, 1);
    }
}
