//! REAPI (Remote Execution API) CAS transfer core
//!
//! Client-side content-addressable storage transfer for the Bazel Remote
//! Execution API v2: existence-filtered bulk upload, knapsack-style
//! batching, bounded-concurrency dispatch with per-item retry, and a
//! Reader family for fetching blobs and Directory trees back out.
//!
//! Execution, ActionCache and Capabilities RPCs, and building a Merkle tree
//! or Command/Action from a local task graph, are outside this crate's
//! scope (spec.md §1 treats them as external collaborators) — this crate
//! only moves already-digested blobs to and from a remote CAS.

pub mod cas;
pub mod client;
pub mod config;
pub mod error;
pub mod merkle;
pub mod retry;

/// Generated protobuf types from REAPI protos
pub mod proto {
    /// Bazel Remote Execution API v2 types
    pub mod build {
        pub mod bazel {
            pub mod remote {
                pub mod execution {
                    pub mod v2 {
                        tonic::include_proto!("build.bazel.remote.execution.v2");
                    }
                }
            }
            pub mod semver {
                tonic::include_proto!("build.bazel.semver");
            }
        }
    }

    /// Google API types
    pub mod google {
        pub mod bytestream {
            tonic::include_proto!("google.bytestream");
        }
        pub mod longrunning {
            tonic::include_proto!("google.longrunning");
        }
        pub mod rpc {
            tonic::include_proto!("google.rpc");
        }
    }
}

// Type aliases for convenience
pub use proto::build::bazel::remote::execution::v2 as reapi;

/// REAPI Digest type (SHA256 hash + size)
pub type ReapiDigest = reapi::Digest;
/// REAPI Directory type
pub type ReapiDirectory = reapi::Directory;
/// REAPI ActionResult type (consumed by output flattening)
pub type ReapiActionResult = reapi::ActionResult;

pub use cas::{BatchUploader, BulkTransferDriver, ExistenceProber, Output, OutputFlattener, Reader, StreamUploader};
pub use config::{AuthConfig, CompressionConfig, RemoteConfig, RetryConfig};
pub use error::{RemoteError, Result};
pub use merkle::Digest;

use client::{ByteStreamClient, CasClient, GrpcChannel};
use retry::RetryEngine;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Facade wiring the transport clients, retry engine, and CAS orchestration
/// layer together behind a single connected session.
///
/// Construction resolves one gRPC channel and is cheap to clone
/// (everything inside is `Arc`-backed); every method reads `RemoteConfig`
/// once at construction time (§3 Lifecycles — the core holds no
/// process-wide mutable state across calls).
#[derive(Clone)]
pub struct CasTransfer {
    driver: Arc<BulkTransferDriver>,
    reader: Arc<Reader>,
    output: Arc<OutputFlattener>,
    cas: Arc<CasClient>,
}

impl CasTransfer {
    /// Connect to the configured REAPI endpoint and build the CAS transfer
    /// pipeline over it.
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        debug!(endpoint = %config.endpoint, "connecting CAS transfer core");
        let channel = GrpcChannel::connect(&config).await?;

        let cas = Arc::new(CasClient::from_channel(&channel, config.clone()));
        let bytestream = Arc::new(ByteStreamClient::from_channel(&channel, config.clone()));
        let retry = Arc::new(RetryEngine::new(config.retry.clone()));

        let driver = Arc::new(BulkTransferDriver::new(
            cas.clone(),
            bytestream.clone(),
            retry.clone(),
            &config,
        ));
        let reader = Arc::new(Reader::new(
            cas.clone(),
            bytestream.clone(),
            retry.clone(),
            &config,
        ));
        let output = Arc::new(OutputFlattener::new(bytestream, retry));

        Ok(Self {
            driver,
            reader,
            output,
            cas,
        })
    }

    /// `WriteBlobs` (§4.E): upload every blob the remote is missing.
    pub async fn write_blobs(&self, blobs: &HashMap<Digest, Vec<u8>>) -> Result<()> {
        self.driver.write_blobs(blobs).await
    }

    /// `ProbeMissing` (§4.A): the subset of `digests` absent from the
    /// remote. Delegates through the same prober `write_blobs` uses, so
    /// concurrency and query-ceiling configuration stay consistent.
    pub async fn probe_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        self.driver.probe_missing(digests).await
    }

    /// `ReadToBuffer` (§4.F).
    pub async fn read_to_buffer(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.reader.read_to_buffer(digest).await
    }

    /// `ReadRange` (§4.F).
    pub async fn read_range(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Vec<u8>> {
        self.reader.read_range(digest, offset, limit).await
    }

    /// Batched multi-digest read via `BatchReadBlobs` (SPEC_FULL.md §C),
    /// packed through the same batcher `write_blobs` uses on the upload
    /// side.
    pub async fn read_blobs(&self, digests: &[Digest]) -> Result<HashMap<Digest, Vec<u8>>> {
        self.reader.read_blobs(digests).await
    }

    /// `ReadToFile` (§4.F).
    pub async fn read_to_file(&self, digest: &Digest, path: &Path) -> Result<i64> {
        self.reader.read_to_file(digest, path).await
    }

    /// `ReadStreamed` (§4.F).
    pub async fn read_streamed<W>(&self, digest: &Digest, sink: &mut W) -> Result<i64>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        self.reader.read_streamed(digest, sink).await
    }

    /// `EnumerateTree` (§4.F).
    pub async fn enumerate_tree(&self, root_digest: &Digest) -> Result<Vec<ReapiDirectory>> {
        self.reader.enumerate_tree(root_digest).await
    }

    /// Output flattening (§4.F): build a `path -> Output` map from an
    /// `ActionResult`, expanding `OutputDirectory` entries via their Tree
    /// blobs.
    pub async fn flatten_outputs(
        &self,
        action_result: &ReapiActionResult,
    ) -> Result<HashMap<std::path::PathBuf, Output>> {
        self.output.flatten(action_result).await
    }
}
