//! Deadlines and retries for store calls
//!
//! Every external store call goes through [`CallPolicy::call`]: each attempt
//! is bounded by the call timeout, and transient failures are retried with
//! exponential backoff before surfacing as `CoreError::Unavailable`.

use graphrec_storage::StorageError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::{RetryConfig, StoreConfig};
use crate::errors::{CoreError, Result};

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// `base * 2^attempt`, capped at `max_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = graphrec_storage::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(CoreError::Unavailable(format!(
                            "{} failed after {} attempts: {}",
                            what, attempt, err
                        )));
                    }
                    let delay = self.backoff(attempt - 1);
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Bound a store call by a deadline; elapsed deadlines become `Timeout`
pub async fn with_deadline<T, Fut>(timeout: Duration, fut: Fut) -> graphrec_storage::Result<T>
where
    Fut: Future<Output = graphrec_storage::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::timeout(format!(
            "store call exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Deadline + retry applied to every store call of a component
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl CallPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.retry),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn new(retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            retry,
            call_timeout,
        }
    }

    /// Deadline on each attempt, retries on transient failures
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = graphrec_storage::Result<T>>,
    {
        let timeout = self.call_timeout;
        self.retry
            .run(what, || with_deadline(timeout, op()))
            .await
    }

    /// Deadline only; a transient failure is reported immediately
    pub async fn once<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = graphrec_storage::Result<T>>,
    {
        Ok(with_deadline(self.call_timeout, fut).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let value = policy
            .run("graph.get", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::unavailable("down"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_unavailable() {
        let policy = RetryPolicy::immediate(3);
        let err = policy
            .run("lease.acquire", || async {
                Err::<(), _>(StorageError::unavailable("down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let err = policy
            .run("graph.get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorageError::serialization("corrupt row"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout() {
        let result: graphrec_storage::Result<()> =
            with_deadline(Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, graphrec_storage::ErrorKind::Timeout);
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_policy_times_out_then_unavailable() {
        let policy = CallPolicy::new(RetryPolicy::immediate(2), Duration::from_millis(10));
        let err = policy
            .call("slow", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }
}
