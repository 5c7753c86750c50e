//! Retry engine: exponential backoff over transport/terminal failures.
//!
//! This is the `RetryEngine` collaborator named in spec.md §6
//! (`RetryEngine.Do(ctx, closure) -> error`, `RetryEngine.ShouldRetry(error)
//! -> bool`). Components above it (BatchUploader, ExistenceProber, the
//! Reader family) never retry on their own — they hand their RPC closure to
//! `RetryEngine::execute` and let it decide.

use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps a `RetryConfig` into the `Do`/`ShouldRetry` contract.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `f` until it succeeds, its error is classified non-retriable by
    /// `should_retry`, or `max_attempts` is reached.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = create_backoff(&self.config);
        let mut attempts = 0;
        let mut last_error = String::new();

        loop {
            attempts += 1;

            match f().await {
                Ok(result) => {
                    if attempts > 1 {
                        debug!(
                            operation = operation_name,
                            attempts, "Operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if err.is_cancelled() {
                        return Err(err);
                    }

                    last_error = err.to_string();

                    if attempts >= self.config.max_attempts {
                        warn!(
                            operation = operation_name,
                            attempts,
                            error = %err,
                            "Operation failed after maximum retries"
                        );
                        return Err(RemoteError::retry_exhausted(
                            operation_name,
                            attempts,
                            last_error,
                        ));
                    }

                    if !self.should_retry(&err) {
                        debug!(
                            operation = operation_name,
                            error = %err,
                            "Error is not retriable, failing immediately"
                        );
                        return Err(err);
                    }

                    if let Some(duration) = backoff.next_backoff() {
                        warn!(
                            operation = operation_name,
                            attempts,
                            error = %err,
                            retry_in_ms = duration.as_millis(),
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    } else {
                        return Err(RemoteError::retry_exhausted(
                            operation_name,
                            attempts,
                            last_error,
                        ));
                    }
                }
            }
        }
    }

    /// Classify an error as retriable (transport/transient) or not.
    pub fn should_retry(&self, err: &RemoteError) -> bool {
        match err {
            RemoteError::ConnectionFailed { .. } => true,

            RemoteError::GrpcError { source, .. } => matches!(
                source.code(),
                tonic::Code::Unavailable
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Internal
                    | tonic::Code::Unknown
                    | tonic::Code::Aborted
            ),

            RemoteError::Timeout { .. } => true,
            RemoteError::IoError { .. } => true,
            RemoteError::ByteStreamWriteFailed { .. } => true,
            RemoteError::ByteStreamIncomplete { .. } => true,
            RemoteError::BatchRetriableSubset { .. } => true,

            // Per-entry batch status codes are classified the same way a
            // transport Status would be, since BatchUpdateBlobs reports
            // them as plain integer codes (§4.C).
            RemoteError::BatchUploadFailed { .. } => false,

            RemoteError::ContentNotFound { .. } => false,
            RemoteError::InvalidDigest(_) => false,
            RemoteError::MerkleError { .. } => false,
            RemoteError::AuthenticationFailed { .. } => false,
            RemoteError::ConfigError(_) => false,
            RemoteError::InvalidArgument(_) => false,
            RemoteError::CapacityExceeded(_) => false,
            RemoteError::RetryExhausted { .. } => false,
            RemoteError::IntegrityError { .. } => false,
            RemoteError::SizeUnrepresentable { .. } => false,
            RemoteError::Cancelled(_) => false,
        }
    }
}

/// Classify a raw per-entry REAPI status code as retriable, for use by
/// call-sites that need the decision before wrapping the failure into a
/// `RemoteError` (e.g. per-entry statuses inside a `BatchUpdateBlobsResponse`).
///
/// REAPI per-entry statuses reuse `google.rpc.Code` numeric values:
/// CANCELLED=1, UNKNOWN=2, DEADLINE_EXCEEDED=4, ABORTED=10,
/// RESOURCE_EXHAUSTED=8, INTERNAL=13, UNAVAILABLE=14.
pub fn is_retryable_code(code: i32) -> bool {
    matches!(code, 1 | 2 | 4 | 8 | 10 | 13 | 14)
}

fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(max_attempts: usize) -> RetryEngine {
        RetryEngine::new(RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = engine(3)
            .execute("test", move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RemoteError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = engine(3)
            .execute("test", move || {
                let cc = cc.clone();
                async move {
                    let count = cc.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(RemoteError::timeout("test", 1))
                    } else {
                        Ok::<_, RemoteError>(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: Result<i32> = engine(2)
            .execute("test", move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(RemoteError::timeout("test", 1))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result.unwrap_err(),
            RemoteError::RetryExhausted { .. }
        ));
    }

    #[tokio::test]
    async fn non_retriable_error_fails_immediately() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: Result<i32> = engine(3)
            .execute("test", move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(RemoteError::invalid_digest("bad digest"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_without_retry() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: Result<i32> = engine(5)
            .execute("test", move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(RemoteError::cancelled("parent context done"))
                }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}
