//! Async retry utilities with capped exponential backoff

use std::time::Duration;

use tokio::sync::watch;

use crate::core::config::RetryConfig;

/// Backoff schedule for one exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// 0 = unbounded
    pub max_attempts: u32,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial interval
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_interval
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_interval)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        !self.enabled || (self.max_attempts > 0 && attempts >= self.max_attempts)
    }
}

/// Why a retried operation gave up
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// The error was not retryable
    Permanent { error: E, attempts: u32 },
    /// Transient errors until the attempt ceiling
    Exhausted { error: E, attempts: u32 },
    /// Cancellation fired while waiting to retry
    Cancelled { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Resolves once `cancel` turns true; never resolves if its sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|&v| v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Retry an async operation with exponential backoff.
///
/// Only errors for which `is_retryable` holds are retried. Backoff sleeps are
/// abandoned as soon as `cancel` turns true. Returns `Ok(attempts)` on success.
pub async fn retry_with_backoff_async<F, Fut, E>(
    policy: &RetryPolicy,
    cancel: &mut watch::Receiver<bool>,
    is_retryable: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(),
    mut operation: F,
) -> Result<u32, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(()) => return Ok(attempts),
            Err(error) => {
                if !is_retryable(&error) {
                    return Err(RetryError::Permanent { error, attempts });
                }
                if policy.exhausted(attempts) {
                    return Err(RetryError::Exhausted { error, attempts });
                }
                let delay = policy.delay_after(attempts);
                tracing::warn!(
                    error = %error,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error"
                );
                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => {
                        return Err(RetryError::Cancelled { error, attempts });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                on_retry();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_ceiling() {
        let p = policy(0);
        assert_eq!(p.delay_after(1), Duration::from_millis(10));
        assert_eq!(p.delay_after(2), Duration::from_millis(20));
        assert_eq!(p.delay_after(3), Duration::from_millis(40));
        assert_eq!(p.delay_after(10), Duration::from_millis(40));
        assert_eq!(p.delay_after(u32::MAX), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_try() {
        let (_tx, mut rx) = watch::channel(false);
        let result =
            retry_with_backoff_async(&policy(3), &mut rx, |_| true, || {}, || async {
                Ok::<(), &str>(())
            })
            .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Cell::new(0);
        let retries = Cell::new(0);
        let result = retry_with_backoff_async(
            &policy(3),
            &mut rx,
            |_| true,
            || retries.set(retries.get() + 1),
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n < 2 { Err("transient error") } else { Ok(()) } }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(retries.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_max_attempts() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Cell::new(0);
        let result = retry_with_backoff_async(&policy(3), &mut rx, |_| true, || {}, || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>("persistent error") }
        })
        .await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                error: "persistent error",
                attempts: 3
            })
        );
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Cell::new(0);
        let result = retry_with_backoff_async(&policy(5), &mut rx, |_| false, || {}, || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>("bad request") }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_makes_one_attempt() {
        let (_tx, mut rx) = watch::channel(false);
        let p = RetryPolicy {
            enabled: false,
            ..policy(5)
        };
        let result =
            retry_with_backoff_async(&p, &mut rx, |_| true, || {}, || async {
                Err::<(), _>("down")
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = retry_with_backoff_async(&policy(0), &mut rx, |_| true, || {}, || async {
            Err::<(), _>("down")
        })
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
