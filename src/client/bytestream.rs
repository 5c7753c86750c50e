//! ByteStream client: the streaming transport used by `StreamUploader` and
//! the Reader family for blobs that bypass `BatchUpdateBlobs`/`BatchReadBlobs`.

use crate::client::channel::{AuthInterceptor, GrpcChannel};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::proto::google::bytestream::byte_stream_client::ByteStreamClient as ProtoByteStreamClient;
use crate::proto::google::bytestream::{QueryWriteStatusRequest, ReadRequest, WriteRequest};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::InterceptedService;
use tonic::transport::Channel;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Default chunk size for streaming uploads/downloads (2 MiB)
const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Client for the `google.bytestream.ByteStream` service.
///
/// Used for blobs too large for `BatchUpdateBlobs`/`BatchReadBlobs`, and for
/// any read/write a caller wants served without buffering the whole blob.
pub struct ByteStreamClient {
    client: ProtoByteStreamClient<InterceptedService<Channel, AuthInterceptor>>,
    config: Arc<RemoteConfig>,
    chunk_size: usize,
}

impl ByteStreamClient {
    /// Create a new ByteStream client from a shared channel
    pub fn from_channel(channel: &GrpcChannel, config: RemoteConfig) -> Self {
        let interceptor = channel.auth_interceptor();
        let client = ProtoByteStreamClient::with_interceptor(channel.channel(), interceptor);
        Self {
            client,
            config: Arc::new(config),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Create a new ByteStream client with custom chunk size
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// `{instance_name}/uploads/{uuid}/blobs/{hash}/{size}`
    fn upload_resource_name(&self, digest: &Digest) -> String {
        let uuid = Uuid::new_v4();
        format!(
            "{}/uploads/{}/blobs/{}/{}",
            self.config.instance_name, uuid, digest.hash, digest.size_bytes
        )
    }

    /// `{instance_name}/blobs/{hash}/{size}`
    fn read_resource_name(&self, digest: &Digest) -> String {
        format!(
            "{}/blobs/{}/{}",
            self.config.instance_name, digest.hash, digest.size_bytes
        )
    }

    /// Upload a blob by chunking an in-memory buffer over `ByteStream.Write`.
    #[instrument(skip(self, data), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn upload_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let resource_name = self.upload_resource_name(digest);
        let total_size = data.len();

        debug!(resource = %resource_name, chunk_size = self.chunk_size, "starting bytestream upload");

        let (tx, rx) = tokio::sync::mpsc::channel::<WriteRequest>(16);
        let stream = ReceiverStream::new(rx);

        let chunk_size = self.chunk_size;
        let resource_name_clone = resource_name.clone();
        let data_vec = data.to_vec();

        tokio::spawn(async move {
            let mut offset = 0i64;
            let data = &data_vec;

            while (offset as usize) < total_size {
                let start = offset as usize;
                let end = std::cmp::min(start + chunk_size, total_size);
                let chunk = data[start..end].to_vec();
                let finish_write = end == total_size;

                let request = WriteRequest {
                    resource_name: if offset == 0 {
                        resource_name_clone.clone()
                    } else {
                        String::new()
                    },
                    write_offset: offset,
                    finish_write,
                    data: chunk,
                };

                if tx.send(request).await.is_err() {
                    break;
                }

                offset = end as i64;
            }
        });

        let mut client = self.client.clone();
        let response = client.write(stream).await.map_err(|e| {
            RemoteError::bytestream_write_failed(&digest.hash, e.to_string())
        })?;

        let committed_size = response.into_inner().committed_size;

        if committed_size != digest.size_bytes {
            return Err(RemoteError::bytestream_incomplete(
                &digest.hash,
                digest.size_bytes,
                committed_size,
            ));
        }

        debug!(committed_size, "bytestream upload complete");
        Ok(())
    }

    /// Upload a blob straight from a file, without buffering it in memory.
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes, path = %path.display()))]
    pub async fn upload_file(&self, digest: &Digest, path: &Path) -> Result<()> {
        let resource_name = self.upload_resource_name(digest);
        let total_size = digest.size_bytes as usize;

        info!(resource = %resource_name, chunk_size = self.chunk_size, path = %path.display(), "starting bytestream file upload");

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| RemoteError::io_error(format!("open {path:?}"), e))?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WriteRequest>(16);
        let stream = ReceiverStream::new(rx);

        let chunk_size = self.chunk_size;
        let resource_name_clone = resource_name.clone();

        let send_task = tokio::spawn(async move {
            let mut offset = 0i64;
            let mut buffer = vec![0u8; chunk_size];

            loop {
                let bytes_read = match file.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };

                let finish_write = (offset as usize) + bytes_read >= total_size;
                let chunk = buffer[..bytes_read].to_vec();

                let request = WriteRequest {
                    resource_name: if offset == 0 {
                        resource_name_clone.clone()
                    } else {
                        String::new()
                    },
                    write_offset: offset,
                    finish_write,
                    data: chunk,
                };

                if tx.send(request).await.is_err() {
                    break;
                }

                offset += bytes_read as i64;

                if finish_write {
                    break;
                }
            }
        });

        let mut client = self.client.clone();
        let response = client.write(stream).await.map_err(|e| {
            RemoteError::bytestream_write_failed(&digest.hash, e.to_string())
        })?;

        let _ = send_task.await;

        let committed_size = response.into_inner().committed_size;

        if committed_size != digest.size_bytes {
            return Err(RemoteError::bytestream_incomplete(
                &digest.hash,
                digest.size_bytes,
                committed_size,
            ));
        }

        info!(committed_size, path = %path.display(), "bytestream file upload complete");
        Ok(())
    }

    /// Query the committed size for a resumable upload resource.
    #[instrument(skip(self))]
    pub async fn query_write_status(&self, resource_name: &str) -> Result<i64> {
        let request = QueryWriteStatusRequest {
            resource_name: resource_name.to_string(),
        };

        let mut client = self.client.clone();
        let response = client
            .query_write_status(request)
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.QueryWriteStatus", e))?;

        Ok(response.into_inner().committed_size)
    }

    /// Read an entire blob into memory via `ByteStream.Read`.
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.read_range(digest, 0, 0).await
    }

    /// Read `[offset, offset + limit)` of a blob (`limit == 0` means "to
    /// end"), the transport behind the Reader family's `ReadRange`.
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes, offset, limit))]
    pub async fn read_range(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Vec<u8>> {
        let resource_name = self.read_resource_name(digest);

        debug!(resource = %resource_name, "starting bytestream read");

        let request = ReadRequest {
            resource_name,
            read_offset: offset,
            read_limit: limit,
        };

        let mut client = self.client.clone();
        let response = client
            .read(request)
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Read", e))?;

        let mut stream = response.into_inner();
        let expected = if limit > 0 {
            limit as usize
        } else {
            (digest.size_bytes - offset).max(0) as usize
        };
        let mut data = Vec::with_capacity(expected);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::grpc_error("ByteStream.Read chunk", e))?;
            data.extend(chunk.data);
        }

        if offset == 0 && limit == 0 && data.len() != digest.size_bytes as usize {
            return Err(RemoteError::integrity_error(
                &digest.hash,
                digest.size_bytes,
                data.len() as i64,
            ));
        }

        debug!(bytes_read = data.len(), "bytestream read complete");
        Ok(data)
    }

    /// Stream a blob to an arbitrary `AsyncWrite` sink, the transport behind
    /// the Reader family's `ReadStreamed`.
    #[instrument(skip(self, sink), fields(digest = %digest.hash, size = digest.size_bytes))]
    pub async fn read_blob_streamed<W>(&self, digest: &Digest, sink: &mut W) -> Result<i64>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        use tokio::io::AsyncWriteExt;

        let resource_name = self.read_resource_name(digest);

        debug!(resource = %resource_name, "starting bytestream streamed read");

        let request = ReadRequest {
            resource_name,
            read_offset: 0,
            read_limit: 0,
        };

        let mut client = self.client.clone();
        let response = client
            .read(request)
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Read", e))?;

        let mut stream = response.into_inner();
        let mut total_bytes = 0i64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::grpc_error("ByteStream.Read chunk", e))?;
            sink.write_all(&chunk.data)
                .await
                .map_err(|e| RemoteError::io_error("write to sink", e))?;
            total_bytes += chunk.data.len() as i64;
        }

        sink.flush()
            .await
            .map_err(|e| RemoteError::io_error("flush sink", e))?;

        if total_bytes != digest.size_bytes {
            return Err(RemoteError::integrity_error(
                &digest.hash,
                digest.size_bytes,
                total_bytes,
            ));
        }

        debug!(bytes_read = total_bytes, "bytestream streamed read complete");
        Ok(total_bytes)
    }

    /// Stream a blob straight to a file, the transport behind `ReadToFile`.
    #[instrument(skip(self), fields(digest = %digest.hash, size = digest.size_bytes, path = %path.display()))]
    pub async fn read_blob_to_file(&self, digest: &Digest, path: &Path) -> Result<i64> {
        use tokio::io::AsyncWriteExt;

        let resource_name = self.read_resource_name(digest);

        info!(resource = %resource_name, path = %path.display(), "starting bytestream read to file");

        let request = ReadRequest {
            resource_name,
            read_offset: 0,
            read_limit: 0,
        };

        let mut client = self.client.clone();
        let response = client
            .read(request)
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Read", e))?;

        let mut stream = response.into_inner();
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| RemoteError::io_error(format!("create {path:?}"), e))?;

        let mut total_bytes = 0usize;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::grpc_error("ByteStream.Read chunk", e))?;
            file.write_all(&chunk.data)
                .await
                .map_err(|e| RemoteError::io_error(format!("write {path:?}"), e))?;
            total_bytes += chunk.data.len();
        }

        file.flush()
            .await
            .map_err(|e| RemoteError::io_error(format!("flush {path:?}"), e))?;

        if total_bytes != digest.size_bytes as usize {
            return Err(RemoteError::integrity_error(
                &digest.hash,
                digest.size_bytes,
                total_bytes as i64,
            ));
        }

        info!(bytes_written = total_bytes, path = %path.display(), "bytestream read to file complete");
        Ok(total_bytes as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_resource_name_format() {
        let digest = Digest::from_bytes(b"test content");
        let expected_parts = ["uploads", "blobs", &digest.hash, &digest.size_bytes.to_string()];

        assert!(!digest.hash.is_empty());
        assert!(digest.size_bytes > 0);
        for part in expected_parts {
            assert!(!part.is_empty());
        }
    }

    #[test]
    fn test_read_resource_name_format() {
        let digest = Digest::from_bytes(b"test content");
        let instance = "default";
        let expected = format!("{instance}/blobs/{}/{}", digest.hash, digest.size_bytes);

        assert!(expected.contains("blobs"));
        assert!(expected.contains(&digest.hash));
    }
}
