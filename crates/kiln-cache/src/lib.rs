//! Content-addressed caching of compiler invocations.
//!
//! This crate implements both cache tiers and the facade that combines them:
//! - a binary, versioned cache-entry descriptor codec
//! - zstd compression for stored artifacts
//! - the local directory-sharded store with atomic insert, cross-process
//!   advisory locking and size-budgeted eviction
//! - the pluggable remote provider abstraction plus the key/value backend
//! - the facade that owns lookup order, replay and insertion

mod compress;
mod entry;
mod error;
mod expected;
mod facade;
mod local;
mod lock;
mod remote;
mod stats;
mod util;

pub use compress::{compress, decompress};
pub use entry::{CacheEntry, CompressionMode, ENTRY_FILE_NAME};
pub use error::CacheError;
pub use expected::{ExpectedFile, ExpectedFiles};
pub use facade::{Cache, Replay};
pub use local::LocalCache;
pub use lock::CacheLock;
pub use remote::{RemoteCache, RemoteCacheProvider};
pub use stats::CacheStats;

pub type Result<T> = std::result::Result<T, CacheError>;
