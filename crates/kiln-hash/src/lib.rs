//! Streaming 128-bit content fingerprints for cache keying.
//!
//! The digest family is XXH3-128: fast, seedless, and deterministic across
//! hosts (the digest is serialized in little-endian byte order regardless of
//! the host). Collision resistance is sufficient for a build cache where a
//! mismatched entry has no safety implications.

mod ar;
mod digest;

pub use digest::{Digest, DigestBuilder};

/// Errors produced while computing fingerprints.
///
/// Any hash failure is fatal for the invocation being fingerprinted: without
/// a digest there is no cache key, so the caller must fall back to running
/// the command directly.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed archive: {0}")]
    MalformedArchive(&'static str),
}
