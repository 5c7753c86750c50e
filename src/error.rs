//! Error types for the REAPI CAS transfer core

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for CAS transfer operations
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors that can occur while transferring blobs to/from a remote CAS
#[derive(Debug, Error, Diagnostic)]
pub enum RemoteError {
    /// Failed to connect to the REAPI server
    #[error("Failed to connect to REAPI server at {endpoint}: {message}")]
    #[diagnostic(
        code(remote::connection_failed),
        help("Check that the endpoint is correct and the server is running")
    )]
    ConnectionFailed { endpoint: String, message: String },

    /// A gRPC call failed (transport/terminal, after the retry engine gave up)
    #[error("gRPC call failed: {operation}")]
    #[diagnostic(code(remote::grpc_error))]
    GrpcError {
        operation: String,
        #[source]
        source: tonic::Status,
    },

    /// Content not found in CAS
    #[error("Content not found in CAS: {digest}")]
    #[diagnostic(
        code(remote::content_not_found),
        help("The requested content may have been garbage collected")
    )]
    ContentNotFound { digest: String },

    /// Invalid digest format
    #[error("Invalid digest format: {0}")]
    #[diagnostic(code(remote::invalid_digest))]
    InvalidDigest(String),

    /// Merkle tree construction failed
    #[error("Failed to build Merkle tree")]
    #[diagnostic(code(remote::merkle_error))]
    MerkleError {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operation timed out
    #[error("Operation timed out after {timeout_secs}s: {operation}")]
    #[diagnostic(
        code(remote::timeout),
        help("Consider increasing the timeout configuration")
    )]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    /// Authentication failed
    #[error("Authentication failed")]
    #[diagnostic(
        code(remote::auth_failed),
        help("Check your API key or credentials")
    )]
    AuthenticationFailed {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Invalid configuration, surfaced pre-flight (e.g. `CASConcurrency < 1`)
    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(remote::config_error))]
    ConfigError(String),

    /// Invalid argument, surfaced pre-flight (e.g. a read range or an
    /// over-capacity batch handed to `BatchUploader`)
    #[error("Invalid argument: {0}")]
    #[diagnostic(code(remote::invalid_argument))]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {operation}")]
    #[diagnostic(code(remote::io_error))]
    IoError {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Retry engine exhausted its attempts
    #[error("Operation failed after {attempts} attempts: {operation}: {message}")]
    #[diagnostic(code(remote::retry_exhausted))]
    RetryExhausted {
        operation: String,
        attempts: usize,
        message: String,
    },

    /// A batch upload failed because one or more entries were fatal
    #[error(
        "Batch upload failed: {failure_count} of {total_count} entries failed, \
         first failure {digest}: {message}"
    )]
    #[diagnostic(code(remote::batch_upload_failed))]
    BatchUploadFailed {
        failure_count: usize,
        total_count: usize,
        digest: String,
        message: String,
    },

    /// A digest/batch violated a server-imposed ceiling before any RPC was
    /// issued
    #[error("Batch exceeds capacity: {0}")]
    #[diagnostic(code(remote::capacity_exceeded))]
    CapacityExceeded(String),

    /// ByteStream.Write did not commit the expected number of bytes
    #[error("ByteStream write for {digest} incomplete: expected {expected} bytes, committed {committed}")]
    #[diagnostic(code(remote::bytestream_incomplete))]
    ByteStreamIncomplete {
        digest: String,
        expected: i64,
        committed: i64,
    },

    /// ByteStream.Write failed outright
    #[error("ByteStream write failed for {digest}: {message}")]
    #[diagnostic(code(remote::bytestream_write_failed))]
    ByteStreamWriteFailed { digest: String, message: String },

    /// Bytes actually read did not match the digest's declared size
    #[error("Integrity error reading {digest}: expected {expected} bytes, got {actual}")]
    #[diagnostic(
        code(remote::integrity_error),
        help("The remote may have returned a truncated or corrupted stream")
    )]
    IntegrityError {
        digest: String,
        expected: i64,
        actual: i64,
    },

    /// A digest's size does not fit the platform's addressable memory range
    #[error("Size {size} for {digest} is too large for addressable memory on this platform")]
    #[diagnostic(code(remote::size_unrepresentable))]
    SizeUnrepresentable { digest: String, size: i64 },

    /// The operation was cancelled via the shared cancellation context
    #[error("Operation cancelled: {0}")]
    #[diagnostic(code(remote::cancelled))]
    Cancelled(String),

    /// A BatchUpdateBlobs round returned only retriable per-entry failures;
    /// signals the retry engine to re-issue with the narrowed subset (§4.C).
    #[error("{retriable_count} batch entries need a retry round")]
    #[diagnostic(code(remote::batch_retriable_subset))]
    BatchRetriableSubset { retriable_count: usize },
}

impl RemoteError {
    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn grpc_error(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::GrpcError {
            operation: operation.into(),
            source,
        }
    }

    pub fn content_not_found(digest: impl Into<String>) -> Self {
        Self::ContentNotFound {
            digest: digest.into(),
        }
    }

    pub fn invalid_digest(msg: impl Into<String>) -> Self {
        Self::InvalidDigest(msg.into())
    }

    pub fn merkle_error(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::MerkleError {
            source: source.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    pub fn auth_failed(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::AuthenticationFailed {
            source: source.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn io_error(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            source,
        }
    }

    pub fn retry_exhausted(
        operation: impl Into<String>,
        attempts: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn batch_upload_failed(
        failure_count: usize,
        total_count: usize,
        digest: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::BatchUploadFailed {
            failure_count,
            total_count,
            digest: digest.into(),
            message: message.into(),
        }
    }

    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn bytestream_incomplete(
        digest: impl Into<String>,
        expected: i64,
        committed: i64,
    ) -> Self {
        Self::ByteStreamIncomplete {
            digest: digest.into(),
            expected,
            committed,
        }
    }

    pub fn bytestream_write_failed(digest: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ByteStreamWriteFailed {
            digest: digest.into(),
            message: message.into(),
        }
    }

    pub fn integrity_error(digest: impl Into<String>, expected: i64, actual: i64) -> Self {
        Self::IntegrityError {
            digest: digest.into(),
            expected,
            actual,
        }
    }

    pub fn size_unrepresentable(digest: impl Into<String>, size: i64) -> Self {
        Self::SizeUnrepresentable {
            digest: digest.into(),
            size,
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn batch_retriable_subset(retriable_count: usize) -> Self {
        Self::BatchRetriableSubset { retriable_count }
    }

    /// True if this error is cancellation, distinct from ordinary failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
