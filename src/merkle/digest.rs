//! Content-addressed digest type for the REAPI CAS transfer core

use crate::error::{RemoteError, Result};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;

/// A content-addressed digest: a SHA-256 hash paired with the blob's size.
///
/// Two digests are equal iff both fields are equal (§3). `Digest` itself
/// derives `Hash`/`Eq` so it can serve directly as its own digest key —
/// the canonical hashable map-key form named in §3 as a separate concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    /// SHA-256 hash in lowercase hex format
    pub hash: String,

    /// Size of the content in bytes
    pub size_bytes: i64,
}

/// Canonical hashable form of a `Digest`, suitable as a map key. Since
/// `Digest` already derives `Hash`/`Eq`, `DigestKey` is `Digest` itself —
/// `to_key`/`from_key` exist to name the §3 "digest key" contract
/// explicitly at call sites that care about it (e.g. deduplicating a
/// `{digest -> bytes}` map).
pub type DigestKey = Digest;

impl Digest {
    /// Create a new digest from hash and size, validating the hash shape.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RemoteError::invalid_digest(format!(
                "expected 64 hex characters for a SHA-256 hash, got '{hash}'"
            )));
        }

        Ok(Self { hash, size_bytes })
    }

    /// Compute a digest from a blob's bytes (the `Digest.FromBlob`
    /// collaborator contract of §6).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = format!("{:x}", hasher.finalize());

        Self {
            hash,
            size_bytes: bytes.len() as i64,
        }
    }

    /// Parse a digest from "hash/size" format (the inverse of
    /// `to_string_format`).
    pub fn parse(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| RemoteError::invalid_digest(format!("expected 'hash/size', got '{s}'")))?;

        let size_bytes: i64 = size
            .parse()
            .map_err(|_| RemoteError::invalid_digest(format!("invalid size in digest: '{size}'")))?;

        Self::new(hash, size_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    pub fn to_string_format(&self) -> String {
        format!("{}/{}", self.hash, self.size_bytes)
    }

    /// `Digest.ToKey` — identity, since `Digest` already implements the key
    /// contract directly.
    #[must_use]
    pub fn to_key(&self) -> DigestKey {
        self.clone()
    }

    /// `Digest.FromKey` — identity, the inverse of `to_key`.
    #[must_use]
    pub fn from_key(key: &DigestKey) -> Self {
        key.clone()
    }

    /// Convert to the REAPI proto `Digest` message.
    #[must_use]
    pub fn to_proto(&self) -> crate::reapi::Digest {
        crate::reapi::Digest {
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
        }
    }

    /// Convert from the REAPI proto `Digest` message.
    pub fn from_proto(proto: &crate::reapi::Digest) -> Result<Self> {
        Self::new(&proto.hash, proto.size_bytes)
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.size_bytes
    }

    /// True if `size_bytes` fits `usize` on this platform — the
    /// portability guard required by spec.md §4.F before allocating a
    /// buffer sized to the digest (always true on 64-bit targets, kept
    /// for 32-bit ones).
    pub fn size_fits_addressable(&self) -> bool {
        usize::try_from(self.size_bytes).is_ok()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::from_bytes(b"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_computes_sha256() {
        let digest = Digest::from_bytes(b"hello world");
        assert_eq!(digest.size_bytes, 11);
        assert_eq!(
            digest.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(Digest::new("a".repeat(32), 100).is_err());
    }

    #[test]
    fn new_rejects_non_hex() {
        let mut hash = "a".repeat(63);
        hash.push('g');
        assert!(Digest::new(hash, 100).is_err());
    }

    #[test]
    fn parse_roundtrips_display() {
        let digest = Digest::from_bytes(b"hello");
        let s = digest.to_string();
        let back = Digest::parse(&s).unwrap();
        assert_eq!(digest, back);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(Digest::parse("invalid").is_err());
        assert!(Digest::parse("hash/notanumber").is_err());
    }

    #[test]
    fn to_key_from_key_roundtrip() {
        let digest = Digest::from_bytes(b"round trip me");
        let key = digest.to_key();
        assert_eq!(Digest::from_key(&key), digest);
    }

    #[test]
    fn empty_digest_has_zero_size() {
        assert!(Digest::default().is_empty());
    }

    #[test]
    fn size_fits_addressable_for_ordinary_sizes() {
        let digest = Digest::new("a".repeat(64), 1024).unwrap();
        assert!(digest.size_fits_addressable());
    }
}
