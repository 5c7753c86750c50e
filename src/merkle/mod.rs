//! Content-addressed digest type shared by every CAS transfer component.
//!
//! The teacher crate also carried a Merkle tree *builder* here (for turning
//! a local file tree into REAPI `Directory` protos ahead of execution);
//! that's an execution-side concern with no counterpart in the CAS
//! transfer core this crate implements, so only the digest type remains.

pub mod digest;

pub use digest::{Digest, DigestKey};
