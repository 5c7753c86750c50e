//! ExistenceProber: `ProbeMissing(digests) -> missing_digests | error` (§4.A).

use crate::client::cas::CasClient;
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::retry::RetryEngine;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Queries the remote for the subset of a digest set that is missing,
/// partitioning the query into `MaxQueryCount`-sized chunks dispatched over
/// a `CASConcurrency`-wide worker pool.
pub struct ExistenceProber {
    cas: Arc<CasClient>,
    retry: Arc<RetryEngine>,
    max_query_count: usize,
    cas_concurrency: usize,
}

impl ExistenceProber {
    pub fn new(cas: Arc<CasClient>, retry: Arc<RetryEngine>, config: &RemoteConfig) -> Self {
        Self {
            cas,
            retry,
            max_query_count: config.max_query_count.max(1),
            cas_concurrency: config.cas_concurrency.max(1),
        }
    }

    /// Returns the subset of `digests` absent from the remote CAS. No order
    /// guarantee: results from different workers are merged under a mutex.
    #[instrument(skip(self, digests), fields(digest_count = digests.len()))]
    pub async fn probe_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        if digests.is_empty() {
            return Ok(vec![]);
        }

        let chunks: Vec<Vec<Digest>> = digests
            .chunks(self.max_query_count)
            .map(<[Digest]>::to_vec)
            .collect();

        let missing = Arc::new(Mutex::new(Vec::new()));
        let semaphore = Arc::new(Semaphore::new(self.cas_concurrency));
        let cancellation = CancellationToken::new();
        let mut tasks = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let cas = self.cas.clone();
            let retry = self.retry.clone();
            let missing = missing.clone();
            let semaphore = semaphore.clone();
            let cancellation = cancellation.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;

                let found = tokio::select! {
                    _ = cancellation.cancelled() => {
                        return Err(RemoteError::cancelled("probe_missing cancelled"));
                    }
                    result = retry.execute("FindMissingBlobs", || {
                        let cas = cas.clone();
                        let chunk = chunk.clone();
                        async move { cas.find_missing_blobs(&chunk).await }
                    }) => result,
                };

                match found {
                    Ok(found) => {
                        let mut guard = missing.lock().unwrap_or_else(|e| e.into_inner());
                        guard.extend(found);
                        Ok(())
                    }
                    Err(e) => {
                        cancellation.cancel();
                        Err(e)
                    }
                }
            }));
        }

        // As in `cas::driver`, join order does not reflect failure order: a
        // fatal RPC error in one task cancels the token, and a sibling
        // blocked on its own RPC/select can surface `RemoteError::Cancelled`
        // first just by joining earlier. Prefer the first non-cancellation
        // error so the cascade artifact never masks the root cause.
        let mut first_non_cancelled = None;
        let mut first_cancelled = None;
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(join_err) => Err(RemoteError::cancelled(format!(
                    "probe worker join error: {join_err}"
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

        let result = Arc::try_unwrap(missing)
            .map(|m| m.into_inner().unwrap_or_default())
            .unwrap_or_default();

        debug!(missing_count = result.len(), "probe_missing complete");
        Ok(result)
    }
}
