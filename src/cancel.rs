//! Deadline and cancellation plumbing shared by every suspension point.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Interrupted {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Run `fut` until it completes, `limit` elapses, or `token` is cancelled.
/// Cancellation wins ties so a cancelled run never starts new work.
pub async fn with_deadline<F>(
    token: &CancellationToken,
    limit: Duration,
    fut: F,
) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    if token.is_cancelled() {
        return Err(Interrupted::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Interrupted::Cancelled),
        res = tokio::time::timeout(limit, fut) => res.map_err(|_| Interrupted::TimedOut(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let token = CancellationToken::new();
        let value = with_deadline(&token, Duration::from_secs(1), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let token = CancellationToken::new();
        let result = with_deadline(&token, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;
        assert_eq!(result, Err(Interrupted::TimedOut(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result = with_deadline(&token, Duration::from_secs(1), async { 1 }).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let token = CancellationToken::new();
        let child = token.child_token();
        let handle = tokio::spawn(async move {
            with_deadline(&child, Duration::from_secs(30), std::future::pending::<()>()).await
        });
        token.cancel();
        assert_eq!(handle.await.unwrap(), Err(Interrupted::Cancelled));
    }
}
