use std::path::PathBuf;

/// Errors produced by cache lookups, inserts and maintenance.
///
/// None of these are allowed to change the wrapped compiler's observed
/// output: callers demote cache I/O failures to misses and remote failures
/// to local-only operation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry descriptor error: {0}")]
    Codec(&'static str),

    #[error("compression error: {message}")]
    Compression { message: String },

    #[error("corrupt cache entry {digest}: {reason}")]
    CorruptEntry { digest: String, reason: String },

    #[error("captured file id {file_id} has no expected file")]
    UnknownFileId { file_id: String },

    #[error("invalid remote endpoint {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("remote cache error: {message}")]
    Remote { message: String },

    #[error("worker pool failure: {message}")]
    Pool { message: String },

    #[error("stats error: {message}")]
    Stats { message: String },

    #[error("cache path {path} is not under the cache root")]
    PathNotUnderCacheRoot { path: PathBuf },
}
