//! Shared L2 cache over a pluggable key/value backend.

mod redis;
mod resp;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::expected::ExpectedFiles;
use kiln_config::Config;
use kiln_hash::Digest;
use std::path::Path;

pub use redis::RedisCacheProvider;

/// Namespace prefix for all kiln keys in the shared store.
const DB_PREFIX: &str = "kiln";

/// Flat key for one stored blob: `kiln_<hex-digest>_<file-id>`.
fn remote_key(digest: &Digest, file: &str) -> String {
    format!("{DB_PREFIX}_{digest}_{file}")
}

/// A remote key/value backend storing opaque blobs under string keys.
///
/// Implementations are synchronous; the facade decides what runs on the
/// worker pool. Errors must be recoverable: the caller downgrades any remote
/// failure to local-only operation for the rest of the invocation.
pub trait RemoteCacheProvider: Send {
    /// Establish the connection. A no-op when already connected.
    fn connect(&mut self) -> Result<(), CacheError>;

    fn is_connected(&self) -> bool;

    /// Fetch and decode the entry descriptor. `None` is a miss.
    fn lookup(&mut self, digest: &Digest) -> Result<Option<CacheEntry>, CacheError>;

    /// Upload the captured files (read from disk, optionally compressed)
    /// followed by the serialized descriptor.
    fn add(
        &mut self,
        digest: &Digest,
        entry: &CacheEntry,
        expected_files: &ExpectedFiles,
    ) -> Result<(), CacheError>;

    /// Download one stored file, decompress if needed, and write it
    /// atomically to `target_path`.
    fn get_file(
        &mut self,
        digest: &Digest,
        file_id: &str,
        target_path: &Path,
        compressed: bool,
    ) -> Result<(), CacheError>;
}

/// Provider selection and lazy connection management.
pub struct RemoteCache {
    provider: Option<Box<dyn RemoteCacheProvider>>,
}

impl RemoteCache {
    /// Build from the configured endpoint. An unset endpoint, an unknown
    /// scheme or a malformed host description leave the remote disabled
    /// (logged, never fatal).
    pub fn from_config(config: &Config) -> Self {
        let Some(endpoint) = config.remote.as_deref() else {
            return Self::disabled();
        };

        let Some((scheme, host_description)) = endpoint.split_once("://") else {
            tracing::error!(
                target = "kiln.remote",
                endpoint,
                "invalid remote address (expected protocol://host:port)"
            );
            return Self::disabled();
        };

        let provider: Option<Box<dyn RemoteCacheProvider>> = match scheme {
            "redis" => match RedisCacheProvider::new(host_description, config) {
                Ok(provider) => Some(Box::new(provider)),
                Err(err) => {
                    tracing::error!(
                        target = "kiln.remote",
                        endpoint,
                        error = %err,
                        "invalid remote endpoint"
                    );
                    None
                }
            },
            other => {
                tracing::error!(
                    target = "kiln.remote",
                    scheme = other,
                    "unsupported remote protocol"
                );
                None
            }
        };

        Self { provider }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub fn lookup(&mut self, digest: &Digest) -> Result<Option<CacheEntry>, CacheError> {
        match self.provider.as_mut() {
            Some(provider) => {
                provider.connect()?;
                provider.lookup(digest)
            }
            None => Ok(None),
        }
    }

    pub fn add(
        &mut self,
        digest: &Digest,
        entry: &CacheEntry,
        expected_files: &ExpectedFiles,
    ) -> Result<(), CacheError> {
        match self.provider.as_mut() {
            Some(provider) => {
                provider.connect()?;
                provider.add(digest, entry, expected_files)
            }
            None => Ok(()),
        }
    }

    pub fn get_file(
        &mut self,
        digest: &Digest,
        file_id: &str,
        target_path: &Path,
        compressed: bool,
    ) -> Result<(), CacheError> {
        match self.provider.as_mut() {
            Some(provider) => {
                provider.connect()?;
                provider.get_file(digest, file_id, target_path, compressed)
            }
            None => Err(CacheError::Remote {
                message: "no remote provider configured".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_naming_matches_the_shared_namespace() {
        let mut builder = kiln_hash::DigestBuilder::new();
        builder.update(b"key test");
        let digest = builder.finish();

        let key = remote_key(&digest, "object");
        assert_eq!(key, format!("kiln_{digest}_object"));
        assert_eq!(
            remote_key(&digest, crate::ENTRY_FILE_NAME),
            format!("kiln_{digest}_.entry")
        );
    }

    #[test]
    fn unknown_scheme_disables_the_remote() {
        let config = Config {
            remote: Some("carrier-pigeon://coop:1".to_string()),
            ..Config::default()
        };
        assert!(!RemoteCache::from_config(&config).is_configured());
    }

    #[test]
    fn missing_endpoint_disables_the_remote() {
        assert!(!RemoteCache::from_config(&Config::default()).is_configured());
    }

    #[test]
    fn redis_endpoint_is_accepted() {
        let config = Config {
            remote: Some("redis://localhost:6379".to_string()),
            ..Config::default()
        };
        assert!(RemoteCache::from_config(&config).is_configured());
    }
}
