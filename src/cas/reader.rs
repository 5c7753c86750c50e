//! Reader family (§4.F): `ReadToBuffer`, `ReadRange`, `ReadToFile`,
//! `ReadStreamed`, `EnumerateTree`.
//!
//! Every read goes through the retry engine individually; `EnumerateTree`
//! wraps its *entire* pagination loop in one retry closure so a mid-walk
//! failure restarts from the last successfully consumed page token rather
//! than from the beginning (§4.F).

use crate::cas::batcher::make_batches;
use crate::client::bytestream::ByteStreamClient;
use crate::client::cas::CasClient;
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi::Directory;
use crate::retry::{RetryEngine, is_retryable_code};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Page size requested per `GetTree` round trip. Cosmetic: the server may
/// return fewer entries than this.
const GET_TREE_PAGE_SIZE: i32 = 1000;

pub struct Reader {
    cas: Arc<CasClient>,
    bytestream: Arc<ByteStreamClient>,
    retry: Arc<RetryEngine>,
    min_read_pad: usize,
    max_batch_bytes: u64,
    max_batch_count: usize,
}

impl Reader {
    pub fn new(
        cas: Arc<CasClient>,
        bytestream: Arc<ByteStreamClient>,
        retry: Arc<RetryEngine>,
        config: &RemoteConfig,
    ) -> Self {
        Self {
            cas,
            bytestream,
            retry,
            min_read_pad: config.min_read_pad,
            max_batch_bytes: config.max_batch_bytes,
            max_batch_count: config.max_batch_count,
        }
    }

    /// Fetch a blob into memory, pre-sizing the buffer to
    /// `sizeBytes + MinReadPad` to avoid reallocation growth on the common
    /// path.
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn read_to_buffer(&self, digest: &Digest) -> Result<Vec<u8>> {
        guard_addressable(digest)?;

        let bytestream = self.bytestream.clone();
        let digest = digest.clone();
        let min_read_pad = self.min_read_pad;

        self.retry
            .execute("ByteStream.Read (buffer)", move || {
                let bytestream = bytestream.clone();
                let digest = digest.clone();
                async move {
                    let mut buffer =
                        Vec::with_capacity(digest.size_bytes as usize + min_read_pad);
                    buffer.extend(bytestream.read_range(&digest, 0, 0).await?);
                    Ok(buffer)
                }
            })
            .await
    }

    /// Fetch several blobs at once via `BatchReadBlobs`, packing `digests`
    /// into the same size/count-bounded batches `BatchUploader` uses on the
    /// write side (§C of SPEC_FULL.md: a CAS client that batches writes and
    /// not reads would be an odd half-feature). Oversize singletons fall
    /// back to `read_to_buffer`'s single-digest path, mirroring how
    /// oversize uploads fall back to `StreamUploader`.
    #[instrument(skip(self, digests), fields(digest_count = digests.len()))]
    pub async fn read_blobs(&self, digests: &[Digest]) -> Result<HashMap<Digest, Vec<u8>>> {
        for digest in digests {
            guard_addressable(digest)?;
        }

        let batches = make_batches(
            digests.to_vec(),
            self.max_batch_bytes,
            self.max_batch_count,
        );

        let mut out = HashMap::with_capacity(digests.len());
        for batch in batches {
            if batch.len() == 1 {
                let digest = &batch[0];
                let bytes = self.read_to_buffer(digest).await?;
                out.insert(digest.clone(), bytes);
            } else {
                self.read_batch(&batch, &mut out).await?;
            }
        }

        Ok(out)
    }

    /// One `BatchReadBlobs` round plus the retriable-subset re-issue loop,
    /// the read-side mirror of `BatchUploader::issue_round`. `fetched`
    /// accumulates successful entries across rounds under its own `Arc`, so
    /// once `execute` returns `Ok` it already holds every digest in `batch`.
    async fn read_batch(&self, batch: &[Digest], out: &mut HashMap<Digest, Vec<u8>>) -> Result<()> {
        let cas = self.cas.clone();
        let pending = Arc::new(Mutex::new(batch.to_vec()));
        let fetched = Arc::new(Mutex::new(HashMap::new()));
        let fetched_result = fetched.clone();

        self.retry
            .execute("BatchReadBlobs", move || {
                let cas = cas.clone();
                let pending = pending.clone();
                let fetched = fetched.clone();
                async move { Self::issue_read_round(&cas, &pending, &fetched).await }
            })
            .await?;

        out.extend(fetched_result.lock().await.drain());
        Ok(())
    }

    /// One `BatchReadBlobs` round: classify per-entry statuses, accumulate
    /// successes into `fetched`, narrow `pending` to the retriable subset
    /// on a retry signal, and fail fatally if any entry is non-retriable.
    async fn issue_read_round(
        cas: &CasClient,
        pending: &Mutex<Vec<Digest>>,
        fetched: &Mutex<HashMap<Digest, Vec<u8>>>,
    ) -> Result<()> {
        let current = pending.lock().await.clone();
        let total_count = current.len();

        let response = cas.batch_read_blobs(&current).await?;

        let mut retriable: Vec<Digest> = Vec::new();
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
                fetched.lock().await.insert(digest, entry.data.clone());
                continue;
            };

            if status.code == 0 {
                fetched.lock().await.insert(digest, entry.data.clone());
                continue;
            }

            if is_retryable_code(status.code) {
                retriable.push(digest);
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
                total_count, digest = %digest, "batch read failed with fatal entries"
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
            debug!(retriable_count, total_count, "re-issuing retriable read subset");
            *pending.lock().await = retriable;
            return Err(RemoteError::batch_retriable_subset(retriable_count));
        }

        Ok(())
    }

    /// Fetch `[offset, offset + limit)`. `limit == 0` means "to end".
    /// `offset + limit` is allowed to exceed `sizeBytes`; the server clamps.
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes, offset, limit))]
    pub async fn read_range(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Vec<u8>> {
        guard_addressable(digest)?;

        if offset < 0 || offset > digest.size_bytes {
            return Err(RemoteError::invalid_argument(format!(
                "offset {offset} out of range for digest of size {}",
                digest.size_bytes
            )));
        }
        if limit < 0 {
            return Err(RemoteError::invalid_argument(format!(
                "limit {limit} must be >= 0"
            )));
        }

        let bytestream = self.bytestream.clone();
        let digest = digest.clone();

        self.retry
            .execute("ByteStream.Read (range)", move || {
                let bytestream = bytestream.clone();
                let digest = digest.clone();
                async move { bytestream.read_range(&digest, offset, limit).await }
            })
            .await
    }

    /// Fetch a blob straight to a file. Errors if bytes-read doesn't match
    /// the digest's declared size (checked by the transport layer).
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes, path = %path.display()))]
    pub async fn read_to_file(&self, digest: &Digest, path: &Path) -> Result<i64> {
        guard_addressable(digest)?;

        let bytestream = self.bytestream.clone();
        let digest = digest.clone();
        let path = path.to_path_buf();

        self.retry
            .execute("ByteStream.Read (to file)", move || {
                let bytestream = bytestream.clone();
                let digest = digest.clone();
                let path = path.clone();
                async move { bytestream.read_blob_to_file(&digest, &path).await }
            })
            .await
    }

    /// Fetch a blob to an arbitrary sink. Errors if bytes-read doesn't match
    /// the digest's declared size.
    #[instrument(skip(self, sink), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn read_streamed<W>(&self, digest: &Digest, sink: &mut W) -> Result<i64>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        guard_addressable(digest)?;
        self.bytestream.read_blob_streamed(digest, sink).await
    }

    /// Enumerate a Directory tree rooted at `root_digest`, paginating via
    /// `GetTree` until the server returns an empty `next_page_token`. The
    /// whole walk is one retry unit: on failure, the next attempt resumes
    /// from the last page token that was successfully consumed, not page 0.
    #[instrument(skip(self), fields(root = %root_digest.hash))]
    pub async fn enumerate_tree(&self, root_digest: &Digest) -> Result<Vec<Directory>> {
        let cas = self.cas.clone();
        let root_digest = root_digest.clone();
        let page_token = Arc::new(Mutex::new(String::new()));
        let directories = Arc::new(Mutex::new(Vec::new()));

        self.retry
            .execute("GetTree", move || {
                let cas = cas.clone();
                let root_digest = root_digest.clone();
                let page_token = page_token.clone();
                let directories = directories.clone();
                async move {
                    loop {
                        let token = page_token.lock().await.clone();
                        let response = cas
                            .get_tree_page(&root_digest, &token, GET_TREE_PAGE_SIZE)
                            .await?;

                        directories.lock().await.extend(response.directories);
                        *page_token.lock().await = response.next_page_token.clone();

                        if response.next_page_token.is_empty() {
                            break;
                        }
                    }

                    debug!(
                        directory_count = directories.lock().await.len(),
                        "enumerate_tree complete"
                    );
                    Ok(directories.lock().await.clone())
                }
            })
            .await
    }
}

/// The portability guard of §4.F: refuse sizes that don't fit `usize` before
/// allocating a buffer sized to a digest. Unreachable on 64-bit targets.
fn guard_addressable(digest: &Digest) -> Result<()> {
    if digest.size_fits_addressable() {
        Ok(())
    } else {
        Err(RemoteError::size_unrepresentable(
            &digest.hash,
            digest.size_bytes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::channel::GrpcChannel;
    use crate::config::{RemoteConfig, RetryConfig};

    fn reader() -> Reader {
        let config = RemoteConfig::default();
        let channel = GrpcChannel::lazy(&config);
        let cas = Arc::new(CasClient::from_channel(&channel, config.clone()));
        let bytestream = Arc::new(ByteStreamClient::from_channel(&channel, config.clone()));
        let retry = Arc::new(RetryEngine::new(RetryConfig::default()));
        Reader::new(cas, bytestream, retry, &config)
    }

    #[tokio::test]
    async fn read_range_rejects_negative_offset() {
        let digest = Digest::new("a".repeat(64), 100).unwrap();
        let result = reader().read_range(&digest, -1, 0).await;
        assert!(matches!(result, Err(RemoteError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn read_range_rejects_offset_past_end() {
        let digest = Digest::new("a".repeat(64), 100).unwrap();
        let result = reader().read_range(&digest, 101, 0).await;
        assert!(matches!(result, Err(RemoteError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn read_range_rejects_negative_limit() {
        let digest = Digest::new("a".repeat(64), 100).unwrap();
        let result = reader().read_range(&digest, 0, -5).await;
        assert!(matches!(result, Err(RemoteError::InvalidArgument(_))));
    }

    #[test]
    fn guard_addressable_accepts_ordinary_size() {
        let digest = Digest::new("a".repeat(64), 4096).unwrap();
        assert!(guard_addressable(&digest).is_ok());
    }

    #[tokio::test]
    async fn read_blobs_of_empty_input_is_a_no_op() {
        let result = reader().read_blobs(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn read_to_file_rejects_unaddressable_size_before_touching_disk() {
        let digest = Digest::new("a".repeat(64), -1).unwrap();
        let result = reader()
            .read_to_file(&digest, Path::new("/tmp/does-not-matter"))
            .await;
        assert!(matches!(result, Err(RemoteError::SizeUnrepresentable { .. })));
    }
}
