//! Retry wrapper for backend operations.

use std::future::Future;

use tracing::warn;

use crate::error::Result;

/// Run `op` until it succeeds or `max_attempts` attempts have failed.
///
/// Attempts are numbered from 1 and re-run immediately. `max_attempts`
/// of 0 still makes a single attempt. Errors that are not retryable are
/// returned after the attempt that produced them. The last error is
/// returned exactly once; intermediate failures are only logged.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> TransferError {
        TransferError::backend("test", "connection reset")
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TransferError>(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_before_budget_runs_out() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(TransferError::backend("test", format!("attempt {}", attempt))) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_zero_attempts_means_one() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(0, "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(5, "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::fatal("test", "bad schema")) }
        })
        .await;
        assert!(matches!(result, Err(TransferError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
