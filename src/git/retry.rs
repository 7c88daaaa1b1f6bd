// Bounded retry with exponential backoff for git and hosting operations.

use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::GitOperationError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delays(&self) -> Vec<Duration> {
        // from_millis(2).factor(f) yields 2f, 4f, 8f...
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        let retries = self.max_attempts.saturating_sub(1) as usize;
        let backoff = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(retries);
        if self.jitter {
            backoff.map(jitter).collect()
        } else {
            backoff.collect()
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or attempts run out. Cancellation interrupts backoff sleeps too.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &'static str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, GitOperationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GitOperationError>>,
    {
        let mut attempt = 0u32;
        let action = || {
            attempt += 1;
            debug!(operation = operation_name, attempt, "Running git operation");
            operation()
        };
        let condition = |e: &GitOperationError| {
            let retry = e.is_retryable();
            if retry {
                warn!(operation = operation_name, error = %e, "Retryable git failure");
            }
            retry
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GitOperationError::Cancelled),
            res = RetryIf::spawn(self.delays(), action, condition) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    fn transient() -> GitOperationError {
        GitOperationError::Repository {
            operation: "push",
            message: "connection reset".into(),
            retryable: true,
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast()
            .run("push", &CancellationToken::new(), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("pushed")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "pushed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast()
            .run("push", &CancellationToken::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast()
            .run("create branch", &CancellationToken::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(GitOperationError::BranchNotFound("main".into())) }
            })
            .await;
        assert_eq!(result.unwrap_err(), GitOperationError::BranchNotFound("main".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> = fast().run("push", &token, || async { Ok(()) }).await;
        assert_eq!(result.unwrap_err(), GitOperationError::Cancelled);
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: false,
        };
        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(250)
            ]
        );
    }
}
