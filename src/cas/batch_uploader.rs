//! BatchUploader: `BatchUpload({digest -> bytes})` (§4.C).
//!
//! Issues one `BatchUpdateBlobs` RPC for the whole batch, splits the
//! per-entry response into OK/retriable/fatal, and either succeeds,
//! re-issues with the narrowed retriable subset, or fails fatally. The
//! subset re-issue rides on `RetryEngine::execute`: the closure rewrites a
//! shared pending-list on each retriable round and returns
//! `RemoteError::BatchRetriableSubset` (classified retriable by
//! `RetryEngine::should_retry`) to trigger another round.

use crate::client::cas::CasClient;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::retry::{RetryEngine, is_retryable_code};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Executes one `BatchUpdateBlobs` batch end to end, including the
/// retriable-subset re-issue loop.
pub struct BatchUploader {
    cas: Arc<CasClient>,
    retry: Arc<RetryEngine>,
    max_batch_bytes: u64,
    max_batch_count: usize,
}

impl BatchUploader {
    pub fn new(
        cas: Arc<CasClient>,
        retry: Arc<RetryEngine>,
        max_batch_bytes: u64,
        max_batch_count: usize,
    ) -> Self {
        Self {
            cas,
            retry,
            max_batch_bytes,
            max_batch_count,
        }
    }

    /// Upload every entry of `blobs` atomically-at-the-wire. Preconditions
    /// (total bytes, count) are checked before any RPC is issued.
    #[instrument(skip(self, blobs), fields(batch_size = blobs.len()))]
    pub async fn upload(&self, blobs: &[(Digest, Vec<u8>)]) -> Result<()> {
        if blobs.is_empty() {
            return Ok(());
        }

        let total_bytes: u64 = blobs.iter().map(|(d, _)| d.size_bytes as u64).sum();
        if total_bytes > self.max_batch_bytes {
            return Err(RemoteError::capacity_exceeded(format!(
                "batch of {total_bytes} bytes exceeds max_batch_bytes {}",
                self.max_batch_bytes
            )));
        }
        if blobs.len() > self.max_batch_count {
            return Err(RemoteError::capacity_exceeded(format!(
                "batch of {} entries exceeds max_batch_count {}",
                blobs.len(),
                self.max_batch_count
            )));
        }

        let pending = Arc::new(Mutex::new(blobs.to_vec()));
        let cas = self.cas.clone();

        self.retry
            .execute("BatchUpdateBlobs", move || {
                let cas = cas.clone();
                let pending = pending.clone();
                async move { Self::issue_round(&cas, &pending).await }
            })
            .await
    }

    /// One round: issue the RPC against the current pending subset, then
    /// classify the response. Rewrites `pending` in place when the round
    /// needs a retry.
    async fn issue_round(cas: &CasClient, pending: &Mutex<Vec<(Digest, Vec<u8>)>>) -> Result<()> {
        let current = pending.lock().await.clone();
        let total_count = current.len();

        let response = cas.batch_update_blobs(&current).await?;

        let mut retriable: Vec<(Digest, Vec<u8>)> = Vec::new();
        let mut first_fatal: Option<(String, String)> = None;
        let mut fatal_count = 0usize;

        for entry in &response.responses {
            let Some(proto_digest) = &entry.digest else {
                continue;
            };
            let Ok(digest) = Digest::from_proto(proto_digest) else {
                continue;
            };
            let Some(status) = &entry.status else {
                continue;
            };

            if status.code == 0 {
                continue;
            }

            if is_retryable_code(status.code) {
                if let Some((_, bytes)) = current.iter().find(|(d, _)| d == &digest) {
                    retriable.push((digest, bytes.clone()));
                }
            } else {
                fatal_count += 1;
                if first_fatal.is_none() {
                    first_fatal = Some((digest.to_string(), status.message.clone()));
                }
            }
        }

        if let Some((digest, message)) = first_fatal {
            warn!(
                fatal_count,
                total_count, digest = %digest, "batch upload failed with fatal entries"
            );
            return Err(RemoteError::batch_upload_failed(
                fatal_count,
                total_count,
                digest,
                message,
            ));
        }

        if !retriable.is_empty() {
            let retriable_count = retriable.len();
            debug!(retriable_count, total_count, "re-issuing retriable subset");
            *pending.lock().await = retriable;
            return Err(RemoteError::batch_retriable_subset(retriable_count));
        }

        debug!(total_count, "batch upload succeeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::channel::GrpcChannel;
    use crate::config::RemoteConfig;

    fn digest_of_size(tag: u8, size: i64) -> Digest {
        let hash = format!("{tag:02x}").repeat(32);
        Digest::new(hash, size).unwrap()
    }

    fn test_cas() -> Arc<CasClient> {
        let config = RemoteConfig::default();
        let channel = GrpcChannel::lazy(&config);
        Arc::new(CasClient::from_channel(&channel, config))
    }

    #[tokio::test]
    async fn rejects_oversize_batch_before_any_rpc() {
        let retry = Arc::new(RetryEngine::new(crate::config::RetryConfig::default()));
        let uploader = BatchUploader::new(test_cas(), retry, 100, 4000);

        let blobs = vec![(digest_of_size(1, 200), vec![0u8; 200])];
        let result = uploader.upload(&blobs).await;
        assert!(matches!(result, Err(RemoteError::CapacityExceeded(_))));
    }

    #[tokio::test]
    async fn rejects_batch_over_count_ceiling() {
        let retry = Arc::new(RetryEngine::new(crate::config::RetryConfig::default()));
        let uploader = BatchUploader::new(test_cas(), retry, 4 * 1024 * 1024, 2);

        let blobs = vec![
            (digest_of_size(1, 1), vec![0u8; 1]),
            (digest_of_size(2, 1), vec![0u8; 1]),
            (digest_of_size(3, 1), vec![0u8; 1]),
        ];
        let result = uploader.upload(&blobs).await;
        assert!(matches!(result, Err(RemoteError::CapacityExceeded(_))));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let retry = Arc::new(RetryEngine::new(crate::config::RetryConfig::default()));
        let uploader = BatchUploader::new(test_cas(), retry, 4 * 1024 * 1024, 4000);
        assert!(uploader.upload(&[]).await.is_ok());
    }
}
