//! BulkTransferDriver: `WriteBlobs({digest -> bytes}) -> error` (§4.E).
//!
//! Orchestrates the full upload pipeline: `ExistenceProber` reduces the
//! input to missing digests, `Batcher` packs them, and a producer/worker
//! pool dispatches each batch to either `BatchUploader` (batches of length
//! > 1) or `StreamUploader` (singletons, including oversize ones that
//! exceed `max_batch_bytes`). A single `CancellationToken` links producer
//! and workers so that the first failure cancels every peer.

use crate::cas::batcher::make_batches;
use crate::cas::batch_uploader::BatchUploader;
use crate::cas::prober::ExistenceProber;
use crate::cas::stream_uploader::StreamUploader;
use crate::client::bytestream::ByteStreamClient;
use crate::client::cas::CasClient;
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::retry::RetryEngine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A unit of dispatch: a batch of digests plus the bytes each one carries,
/// pulled from the caller's read-only `{digest -> bytes}` map.
type WorkItem = Vec<(Digest, Vec<u8>)>;

/// Orchestrates `WriteBlobs` end to end over a bounded worker pool.
pub struct BulkTransferDriver {
    cas: Arc<CasClient>,
    prober: ExistenceProber,
    batch_uploader: Arc<BatchUploader>,
    stream_uploader: Arc<StreamUploader>,
    cas_concurrency: usize,
    use_batch_ops: bool,
    max_batch_bytes: u64,
    max_batch_count: usize,
}

impl BulkTransferDriver {
    pub fn new(
        cas: Arc<CasClient>,
        bytestream: Arc<ByteStreamClient>,
        retry: Arc<RetryEngine>,
        config: &RemoteConfig,
    ) -> Self {
        let prober = ExistenceProber::new(cas.clone(), retry.clone(), config);
        let batch_uploader = Arc::new(BatchUploader::new(
            cas.clone(),
            retry.clone(),
            config.max_batch_bytes,
            config.max_batch_count,
        ));
        let stream_uploader = Arc::new(StreamUploader::new(bytestream, retry));

        Self {
            cas,
            prober,
            batch_uploader,
            stream_uploader,
            cas_concurrency: config.cas_concurrency,
            use_batch_ops: config.use_batch_ops,
            max_batch_bytes: config.max_batch_bytes,
            max_batch_count: config.max_batch_count,
        }
    }

    /// Upload every blob in `blobs` that the remote lacks. `blobs` is
    /// read-only for the duration of the call (§3).
    #[instrument(skip(self, blobs), fields(blob_count = blobs.len()))]
    pub async fn write_blobs(&self, blobs: &HashMap<Digest, Vec<u8>>) -> Result<()> {
        if self.cas_concurrency < 1 {
            return Err(RemoteError::config_error(
                "CASConcurrency must be >= 1".to_string(),
            ));
        }

        let digests: Vec<Digest> = blobs.keys().cloned().collect();
        let missing = self.prober.probe_missing(&digests).await?;

        if missing.is_empty() {
            debug!("all digests already present remotely");
            return Ok(());
        }

        let batches: Vec<WorkItem> = if self.use_batch_ops {
            make_batches(missing, self.max_batch_bytes, self.max_batch_count)
                .into_iter()
                .map(|batch| Self::attach_bytes(batch, blobs))
                .collect()
        } else {
            missing
                .into_iter()
                .map(|digest| Self::attach_bytes(vec![digest], blobs))
                .collect()
        };

        info!(batch_count = batches.len(), "dispatching batches");
        self.dispatch(batches).await
    }

    fn attach_bytes(batch: Vec<Digest>, blobs: &HashMap<Digest, Vec<u8>>) -> WorkItem {
        batch
            .into_iter()
            .map(|digest| {
                let bytes = blobs.get(&digest).cloned().unwrap_or_default();
                (digest, bytes)
            })
            .collect()
    }

    async fn dispatch(&self, batches: Vec<WorkItem>) -> Result<()> {
        let worker_count = self.cas_concurrency.min(batches.len().max(1));
        let (tx, rx) = mpsc::channel::<WorkItem>(self.cas_concurrency);
        let rx = Arc::new(Mutex::new(rx));
        let cancellation = CancellationToken::new();

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = rx.clone();
            let batch_uploader = self.batch_uploader.clone();
            let stream_uploader = self.stream_uploader.clone();
            let cancellation = cancellation.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let recv_outcome = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancellation.cancelled() => None,
                            item = guard.recv() => Some(item),
                        }
                    };

                    let batch = match recv_outcome {
                        None => return Err(RemoteError::cancelled("write_blobs cancelled")),
                        Some(None) => return Ok(()),
                        Some(Some(batch)) => batch,
                    };

                    let result = if batch.len() == 1 {
                        let (digest, bytes) = &batch[0];
                        stream_uploader.upload(digest, bytes).await
                    } else {
                        batch_uploader.upload(&batch).await
                    };

                    if let Err(e) = result {
                        cancellation.cancel();
                        return Err(e);
                    }
                }
            }));
        }

        let producer_cancellation = cancellation.clone();
        let producer = tokio::spawn(async move {
            for (i, batch) in batches.into_iter().enumerate() {
                if i > 0 && i % 25 == 0 {
                    debug!(fed = i, "batch upload progress");
                }

                tokio::select! {
                    _ = producer_cancellation.cancelled() => {
                        return Err(RemoteError::cancelled("producer cancelled mid-feed"));
                    }
                    send_result = tx.send(batch) => {
                        if send_result.is_err() {
                            return Err(RemoteError::cancelled("worker pool closed early"));
                        }
                    }
                }
            }
            Ok(())
        });

        let producer_result = producer.await.unwrap_or_else(|join_err| {
            Err(RemoteError::cancelled(format!(
                "producer join error: {join_err}"
            )))
        });

        // A fatal error in one worker cancels the token, which can cause a
        // peer still blocked on `recv` to surface `RemoteError::Cancelled`
        // before the fatal error is observed here. Join order does not
        // reflect failure order, so prefer the first non-cancellation error
        // over a cancellation cascade artifact; fall back to a cancellation
        // only if every worker's error was one.
        let mut first_non_cancelled = None;
        let mut first_cancelled = None;
        for worker in workers {
            let result = match worker.await {
                Ok(result) => result,
                Err(join_err) => Err(RemoteError::cancelled(format!(
                    "worker join error: {join_err}"
                ))),
            };

            if let Err(e) = result {
                if e.is_cancelled() {
                    if first_cancelled.is_none() {
                        first_cancelled = Some(e);
                    }
                } else if first_non_cancelled.is_none() {
                    first_non_cancelled = Some(e);
                }
            }
        }

        if let Some(e) = first_non_cancelled.or(first_cancelled) {
            return Err(e);
        }

        if let Err(e) = producer_result {
            if !e.is_cancelled() {
                return Err(e);
            }
        }

        if cancellation.is_cancelled() {
            warn!("write_blobs ended via cancellation with no surfaced worker error");
        }

        Ok(())
    }

    /// `ProbeMissing` (§4.A), exposed standalone so callers can check
    /// existence without uploading.
    pub async fn probe_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        self.prober.probe_missing(digests).await
    }

    /// Exposed for `cas::reader`/`cas::output`, which share the transport
    /// client rather than duplicating connection setup.
    pub fn cas_client(&self) -> &Arc<CasClient> {
        &self.cas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::channel::GrpcChannel;
    use crate::config::RetryConfig;

    fn driver() -> BulkTransferDriver {
        let config = RemoteConfig::default();
        let channel = GrpcChannel::lazy(&config);
        let cas = Arc::new(CasClient::from_channel(&channel, config.clone()));
        let bytestream = Arc::new(ByteStreamClient::from_channel(&channel, config.clone()));
        let retry = Arc::new(RetryEngine::new(RetryConfig::default()));
        BulkTransferDriver::new(cas, bytestream, retry, &config)
    }

    #[tokio::test]
    async fn rejects_zero_concurrency() {
        let mut d = driver();
        d.cas_concurrency = 0;
        let blobs = HashMap::new();
        let result = d.write_blobs(&blobs).await;
        assert!(matches!(result, Err(RemoteError::ConfigError(_))));
    }

    #[test]
    fn attach_bytes_preserves_order_and_content() {
        let digest = Digest::from_bytes(b"hello");
        let mut blobs = HashMap::new();
        blobs.insert(digest.clone(), b"hello".to_vec());

        let attached = BulkTransferDriver::attach_bytes(vec![digest.clone()], &blobs);
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].0, digest);
        assert_eq!(attached[0].1, b"hello");
    }
}
