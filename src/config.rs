//! Configuration types for the REAPI CAS transfer core
//!
//! Every option here is read once per top-level call (`WriteBlobs`,
//! `ProbeMissing`, a Reader-family read); the core holds no process-wide
//! mutable configuration state.

use serde::{Deserialize, Serialize};

/// Configuration for a REAPI remote CAS endpoint and the transfer core's
/// batching/concurrency policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// REAPI server endpoint (e.g., "grpcs://cas.example.com:8980")
    pub endpoint: String,

    /// Instance name, an opaque prefix inserted into resource names and
    /// RPC requests routing to a particular remote tenant.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Authentication configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Compression settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionConfig>,

    /// Worker-pool width for `BulkTransferDriver` and `ExistenceProber`.
    /// Must be >= 1; validated at the start of `WriteBlobs`/`ProbeMissing`.
    #[serde(default = "default_cas_concurrency")]
    pub cas_concurrency: usize,

    /// When true, missing digests are packed into size/count-bounded
    /// batches (§4.B) before dispatch. When false, every digest becomes a
    /// singleton batch and is routed through `StreamUploader`.
    #[serde(default = "default_true")]
    pub use_batch_ops: bool,

    /// Maximum total bytes per `BatchUpdateBlobs` batch (excludes
    /// oversize singletons, which bypass this ceiling by routing through
    /// `StreamUploader`). Default: 4 MiB minus 1 KiB of wire overhead.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,

    /// Maximum element count per `BatchUpdateBlobs` batch.
    #[serde(default = "default_max_batch_count")]
    pub max_batch_count: usize,

    /// Maximum digest count per `FindMissingBlobs` query-batch.
    #[serde(default = "default_max_query_count")]
    pub max_query_count: usize,

    /// Minimum extra capacity allocated beyond a digest's declared size
    /// when pre-sizing a `ReadToBuffer` buffer, to avoid reallocation on
    /// off-by-a-little server responses.
    #[serde(default = "default_min_read_pad")]
    pub min_read_pad: usize,

    /// Operation timeout in seconds, enforced per RPC by a deadline helper.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            instance_name: default_instance_name(),
            auth: None,
            compression: None,
            cas_concurrency: default_cas_concurrency(),
            use_batch_ops: default_true(),
            max_batch_bytes: default_max_batch_bytes(),
            max_batch_count: default_max_batch_count(),
            max_query_count: default_max_query_count(),
            min_read_pad: default_min_read_pad(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Authentication configuration (resolved, ready to use — secrets must be
/// resolved to plain strings before constructing this type).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Bearer token authentication (Authorization: Bearer <token>)
    Bearer { token: String },

    /// mTLS authentication
    #[serde(rename = "mtls")]
    MTls {
        cert_path: String,
        key_path: String,
        ca_path: Option<String>,
    },
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    /// Enable compression for uploads
    #[serde(default = "default_true")]
    pub upload: bool,

    /// Enable compression for downloads
    #[serde(default = "default_true")]
    pub download: bool,
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// Default value functions (used by both `Default` impls and serde defaults)
fn default_instance_name() -> String {
    String::new()
}

fn default_true() -> bool {
    true
}

fn default_cas_concurrency() -> usize {
    16
}

/// 4 MiB minus 1 KiB of wire-overhead slack, per spec.
fn default_max_batch_bytes() -> u64 {
    4 * 1024 * 1024 - 1024
}

fn default_max_batch_count() -> usize {
    4000
}

fn default_max_query_count() -> usize {
    10_000
}

fn default_min_read_pad() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_ceilings() {
        let config = RemoteConfig::default();
        assert_eq!(config.max_batch_bytes, 4 * 1024 * 1024 - 1024);
        assert_eq!(config.max_batch_count, 4000);
        assert_eq!(config.max_query_count, 10_000);
        assert!(config.use_batch_ops);
        assert_eq!(config.cas_concurrency, 16);
    }

    #[test]
    fn round_trips_through_json() {
        let config = RemoteConfig {
            endpoint: "grpcs://cas.example.com:8980".to_string(),
            auth: Some(AuthConfig::Bearer {
                token: "tok".to_string(),
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let back: RemoteConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn missing_fields_fall_back_to_spec_defaults() {
        let config: RemoteConfig =
            serde_json::from_str(r#"{"endpoint": "grpc://localhost:8980"}"#).unwrap();
        assert_eq!(config.max_batch_count, 4000);
        assert_eq!(config.cas_concurrency, 16);
    }
}
