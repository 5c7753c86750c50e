//! StreamUploader: `StreamUpload(bytes) -> digest` (§4.D).
//!
//! Used for oversize singleton batches (a blob individually larger than
//! `max_batch_bytes`) and whenever batching is disabled. Each call derives a
//! fresh upload resource name via `ByteStreamClient`, which is what keeps
//! concurrent uploads of the same digest independent at the wire protocol.

use crate::client::bytestream::ByteStreamClient;
use crate::error::Result;
use crate::merkle::Digest;
use crate::retry::RetryEngine;
use std::sync::Arc;
use tracing::instrument;

/// Uploads a single blob via `ByteStream.Write`, under the retry engine.
pub struct StreamUploader {
    bytestream: Arc<ByteStreamClient>,
    retry: Arc<RetryEngine>,
}

impl StreamUploader {
    pub fn new(bytestream: Arc<ByteStreamClient>, retry: Arc<RetryEngine>) -> Self {
        Self { bytestream, retry }
    }

    /// Upload `bytes` under the digest the caller has already computed (the
    /// common path inside `BulkTransferDriver`, where every blob in the
    /// `{digest -> bytes}` map is pre-keyed).
    #[instrument(skip(self, bytes), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn upload(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let bytestream = self.bytestream.clone();
        let digest = digest.clone();
        let bytes = bytes.to_vec();

        self.retry
            .execute("ByteStream.Write", move || {
                let bytestream = bytestream.clone();
                let digest = digest.clone();
                let bytes = bytes.clone();
                async move { bytestream.upload_blob(&digest, &bytes).await }
            })
            .await
    }

    /// The standalone `StreamUpload` contract of §4.D: compute the digest
    /// from the bytes, then upload under it.
    pub async fn upload_computing_digest(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::from_bytes(bytes);
        self.upload(&digest, bytes).await?;
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::channel::GrpcChannel;
    use crate::config::{RemoteConfig, RetryConfig};

    #[test]
    fn computing_digest_matches_from_bytes() {
        let data = b"a blob to stream upload";
        assert_eq!(Digest::from_bytes(data), Digest::from_bytes(data));
    }

    #[tokio::test]
    async fn construction_does_not_dial() {
        let config = RemoteConfig::default();
        let channel = GrpcChannel::lazy(&config);
        let bytestream = Arc::new(ByteStreamClient::from_channel(&channel, config));
        let retry = Arc::new(RetryEngine::new(RetryConfig::default()));
        let _uploader = StreamUploader::new(bytestream, retry);
    }
}
