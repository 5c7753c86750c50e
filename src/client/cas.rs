//! Thin transport wrapper over the REAPI `ContentAddressableStorage` service.
//!
//! This client issues exactly the RPC it's asked for and returns the raw
//! per-entry responses; it does not batch, retry, or split by fatal/retriable
//! status. That policy belongs to `cas::prober`, `cas::batcher`, and
//! `cas::batch_uploader`, which sit above this client and the retry engine.

use crate::client::channel::{AuthInterceptor, GrpcChannel};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi::{
    BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, GetTreeRequest, GetTreeResponse, batch_update_blobs_request,
    content_addressable_storage_client::ContentAddressableStorageClient,
};
use futures::StreamExt;
use std::sync::Arc;
use tonic::codegen::InterceptedService;
use tonic::transport::Channel;
use tracing::{debug, instrument};

/// REAPI `DigestFunction.Value.SHA256`
const DIGEST_FUNCTION_SHA256: i32 = 1;

/// Client for the REAPI `ContentAddressableStorage` service
pub struct CasClient {
    client: ContentAddressableStorageClient<InterceptedService<Channel, AuthInterceptor>>,
    config: Arc<RemoteConfig>,
}

impl CasClient {
    /// Create a new CAS client from a shared channel
    pub fn from_channel(channel: &GrpcChannel, config: RemoteConfig) -> Self {
        let interceptor = channel.auth_interceptor();
        let client =
            ContentAddressableStorageClient::with_interceptor(channel.channel(), interceptor);
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// Issue one `FindMissingBlobs` RPC for exactly the digests given; the
    /// caller is responsible for respecting `max_query_count` (§4.A).
    #[instrument(skip(self, digests), fields(digest_count = digests.len()))]
    pub async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        if digests.is_empty() {
            return Ok(vec![]);
        }

        let request = FindMissingBlobsRequestBuilder::build(&self.config.instance_name, digests);

        let mut client = self.client.clone();
        let response = client
            .find_missing_blobs(request)
            .await
            .map_err(|e| RemoteError::grpc_error("FindMissingBlobs", e))?;

        let missing: Result<Vec<Digest>> = response
            .into_inner()
            .missing_blob_digests
            .iter()
            .map(Digest::from_proto)
            .collect();

        let missing = missing?;
        debug!(missing_count = missing.len(), "find_missing_blobs complete");
        Ok(missing)
    }

    /// Issue one `BatchUpdateBlobs` RPC for exactly the entries given; the
    /// caller (`BatchUploader`) is responsible for packing within
    /// `max_batch_bytes`/`max_batch_count` and for interpreting per-entry
    /// statuses in the response (§4.C).
    #[instrument(skip(self, blobs), fields(batch_size = blobs.len()))]
    pub async fn batch_update_blobs(
        &self,
        blobs: &[(Digest, Vec<u8>)],
    ) -> Result<BatchUpdateBlobsResponse> {
        let requests: Vec<batch_update_blobs_request::Request> = blobs
            .iter()
            .map(|(digest, data)| batch_update_blobs_request::Request {
                digest: Some(digest.to_proto()),
                data: data.clone(),
                compressor: 0,
            })
            .collect();

        let request = BatchUpdateBlobsRequest {
            instance_name: self.config.instance_name.clone(),
            requests,
            digest_function: DIGEST_FUNCTION_SHA256,
        };

        let mut client = self.client.clone();
        let response = client
            .batch_update_blobs(request)
            .await
            .map_err(|e| RemoteError::grpc_error("BatchUpdateBlobs", e))?
            .into_inner();

        debug!(response_count = response.responses.len(), "batch_update_blobs complete");
        Ok(response)
    }

    /// Issue one `BatchReadBlobs` RPC for exactly the digests given; the
    /// caller interprets per-entry statuses (mirrors `batch_update_blobs`).
    #[instrument(skip(self, digests), fields(digest_count = digests.len()))]
    pub async fn batch_read_blobs(&self, digests: &[Digest]) -> Result<BatchReadBlobsResponse> {
        let proto_digests: Vec<_> = digests.iter().map(Digest::to_proto).collect();

        let request = BatchReadBlobsRequest {
            instance_name: self.config.instance_name.clone(),
            digests: proto_digests,
            acceptable_compressors: vec![],
            digest_function: DIGEST_FUNCTION_SHA256,
        };

        let mut client = self.client.clone();
        let response = client
            .batch_read_blobs(request)
            .await
            .map_err(|e| RemoteError::grpc_error("BatchReadBlobs", e))?
            .into_inner();

        debug!(response_count = response.responses.len(), "batch_read_blobs complete");
        Ok(response)
    }

    /// Fetch a single page of `GetTree`; the caller (Reader family's
    /// `EnumerateTree`) drives pagination via `next_page_token` (§4.F).
    ///
    /// `GetTree` is itself server-streaming (one request can yield several
    /// `GetTreeResponse` messages before the server settles on a
    /// `next_page_token`), so this drains the whole stream for the given
    /// `page_token`, accumulating `directories` across every message and
    /// taking `next_page_token` from the last one.
    #[instrument(skip(self), fields(root = %root_digest.hash, page_token = %page_token))]
    pub async fn get_tree_page(
        &self,
        root_digest: &Digest,
        page_token: &str,
        page_size: i32,
    ) -> Result<GetTreeResponse> {
        let request = GetTreeRequest {
            instance_name: self.config.instance_name.clone(),
            root_digest: Some(root_digest.to_proto()),
            page_size,
            page_token: page_token.to_string(),
            digest_function: DIGEST_FUNCTION_SHA256,
        };

        let mut client = self.client.clone();
        let mut stream = client
            .get_tree(request)
            .await
            .map_err(|e| RemoteError::grpc_error("GetTree", e))?
            .into_inner();

        let mut directories = Vec::new();
        let mut next_page_token = String::new();

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| RemoteError::grpc_error("GetTree stream", e))?;
            directories.extend(message.directories);
            next_page_token = message.next_page_token;
        }

        Ok(GetTreeResponse {
            directories,
            next_page_token,
        })
    }
}

struct FindMissingBlobsRequestBuilder;

impl FindMissingBlobsRequestBuilder {
    fn build(instance_name: &str, digests: &[Digest]) -> crate::reapi::FindMissingBlobsRequest {
        crate::reapi::FindMissingBlobsRequest {
            instance_name: instance_name.to_string(),
            blob_digests: digests.iter().map(Digest::to_proto).collect(),
            digest_function: DIGEST_FUNCTION_SHA256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_conversion_roundtrip() {
        let original = Digest::from_bytes(b"hello world");
        let proto = original.to_proto();
        let back = Digest::from_proto(&proto).unwrap();

        assert_eq!(original, back);
    }

    #[test]
    fn find_missing_blobs_request_carries_instance_and_digests() {
        let digests = vec![Digest::from_bytes(b"a"), Digest::from_bytes(b"b")];
        let request = FindMissingBlobsRequestBuilder::build("my-instance", &digests);

        assert_eq!(request.instance_name, "my-instance");
        assert_eq!(request.blob_digests.len(), 2);
        assert_eq!(request.digest_function, DIGEST_FUNCTION_SHA256);
    }
}
