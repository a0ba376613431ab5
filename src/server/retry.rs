//! Exponential backoff for transient unavailability.

use crate::core::config::RpcConfig;
use crate::core::error::{TesseraError, TesseraResult};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max_interval: Duration,
    /// Total time spent retrying before the last error is returned.
    pub budget: Duration,
}

impl RetryPolicy {
    pub fn from_config(rpc: &RpcConfig) -> Self {
        Self {
            initial: Duration::from_millis(rpc.retry_initial_ms),
            max_interval: Duration::from_millis(rpc.retry_max_ms),
            budget: Duration::from_millis(rpc.retry_budget_ms),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.budget))
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RpcConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's budget runs out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &'static str, mut op: F) -> TesseraResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TesseraResult<T>>,
{
    let attempt = || {
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if e.is_retryable() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    };
    backoff::future::retry_notify(policy.backoff(), attempt, |err: TesseraError, wait: Duration| {
        tracing::debug!(op = what, error = %err, wait_ms = wait.as_millis() as u64, "retrying");
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::UnavailableReason;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            budget: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn retries_unavailable_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retry(&fast(), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TesseraError::unavailable(UnavailableReason::NoLeader))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = with_retry(&fast(), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TesseraError::invalid_argument("bad"))
        })
        .await
        .unwrap_err();
        assert_eq!(err, TesseraError::invalid_argument("bad"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
