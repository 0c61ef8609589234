use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::expected::ExpectedFiles;
use crate::local::LocalCache;
use crate::remote::RemoteCache;
use crate::stats::CacheStats;
use kiln_config::Config;
use kiln_hash::Digest;
use kiln_pool::{IoWorker, PoolMode, WorkerPool};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A materialized cache hit: the captured side effects to reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub std_out: Vec<u8>,
    pub std_err: Vec<u8>,
    pub return_code: i32,
}

impl From<CacheEntry> for Replay {
    fn from(entry: CacheEntry) -> Self {
        Self {
            std_out: entry.std_out,
            std_err: entry.std_err,
            return_code: entry.return_code,
        }
    }
}

/// Combines the local store and the optional remote into one lookup/insert
/// surface, and owns replay (materializing artifacts into target paths).
pub struct Cache {
    local: LocalCache,
    remote: Arc<Mutex<RemoteCache>>,
    pool: WorkerPool,
}

impl Cache {
    pub fn new(config: &Config, io: IoWorker, pool_mode: PoolMode) -> Result<Self, CacheError> {
        Ok(Self {
            local: LocalCache::new(config, io)?,
            remote: Arc::new(Mutex::new(RemoteCache::from_config(config))),
            pool: WorkerPool::new(pool_mode),
        })
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Look up `digest`, materializing artifacts on a hit.
    ///
    /// The local tier is consulted first; a local entry that cannot satisfy a
    /// required expected file is corrupt — it is evicted and the lookup
    /// continues as a miss. A remote hit additionally populates the local
    /// store so the next invocation on this host hits locally. Remote
    /// failures degrade to local-only behavior.
    pub fn lookup(
        &self,
        digest: &Digest,
        expected_files: &ExpectedFiles,
        allow_hard_links: bool,
        create_target_dirs: bool,
    ) -> Result<Option<Replay>, CacheError> {
        if let Some(entry) = self.local.lookup(digest)? {
            match self.materialize_local(
                digest,
                &entry,
                expected_files,
                allow_hard_links,
                create_target_dirs,
            ) {
                Ok(()) => {
                    self.record(CacheStats::local_hit());
                    tracing::debug!(target = "kiln.cache", digest = %digest, "local cache hit");
                    return Ok(Some(Replay::from(entry)));
                }
                Err(err) => {
                    tracing::error!(
                        target = "kiln.cache",
                        digest = %digest,
                        error = %err,
                        "failed to replay local entry, evicting"
                    );
                    if let Err(evict_err) = self.local.evict_entry(digest) {
                        tracing::error!(
                            target = "kiln.cache",
                            digest = %digest,
                            error = %evict_err,
                            "failed to evict corrupt entry"
                        );
                    }
                }
            }
        }

        let (remote_configured, remote_entry) = {
            let mut remote = self.remote.lock().unwrap_or_else(|e| e.into_inner());
            let configured = remote.is_configured();
            let entry = if configured {
                match remote.lookup(digest) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::info!(
                            target = "kiln.remote",
                            digest = %digest,
                            error = %err,
                            "remote lookup failed, continuing local-only"
                        );
                        None
                    }
                }
            } else {
                None
            };
            (configured, entry)
        };

        if let Some(entry) = remote_entry {
            match self.materialize_remote(digest, &entry, expected_files, create_target_dirs) {
                Ok(()) => {
                    self.populate_local(digest, &entry, expected_files);
                    self.record(CacheStats::remote_hit());
                    tracing::debug!(target = "kiln.cache", digest = %digest, "remote cache hit");
                    return Ok(Some(Replay::from(entry)));
                }
                Err(err) => {
                    tracing::info!(
                        target = "kiln.remote",
                        digest = %digest,
                        error = %err,
                        "failed to replay remote entry, continuing local-only"
                    );
                }
            }
        }

        let mut delta = CacheStats::local_miss();
        if remote_configured {
            delta.remote_misses = 1;
        }
        self.record(delta);
        Ok(None)
    }

    /// Insert a successful run: local store first (synchronously), then a
    /// fire-and-forget push to the remote on the worker pool.
    pub fn add(
        &self,
        digest: &Digest,
        entry: CacheEntry,
        expected_files: &ExpectedFiles,
        allow_hard_links: bool,
    ) -> Result<(), CacheError> {
        // Failed runs are never cached; a transient failure must not poison
        // the cache for every later invocation with this fingerprint.
        if entry.return_code != 0 {
            tracing::debug!(
                target = "kiln.cache",
                digest = %digest,
                return_code = entry.return_code,
                "refusing to cache a failed run"
            );
            return Ok(());
        }

        self.local
            .add(digest, &entry, expected_files, allow_hard_links, &self.pool)?;

        let remote_configured = self
            .remote
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_configured();
        if remote_configured {
            let remote = Arc::clone(&self.remote);
            let digest = *digest;
            let expected_files = expected_files.clone();
            self.pool.enqueue(move || {
                let mut remote = remote.lock().unwrap_or_else(|e| e.into_inner());
                remote.add(&digest, &entry, &expected_files)?;
                Ok(())
            });
        }
        Ok(())
    }

    /// Drain deferred work (remote pushes) before process exit.
    ///
    /// Push failures are logged, never surfaced: the local insert already
    /// succeeded and the compiler's output is unaffected.
    pub fn flush(&self) {
        if let Err(err) = self.pool.wait() {
            tracing::info!(
                target = "kiln.remote",
                error = %err,
                "deferred remote cache work failed"
            );
        }
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.local.clear()
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        self.local.stats()
    }

    pub fn zero_stats(&self) -> Result<(), CacheError> {
        self.local.zero_stats()
    }

    pub fn perform_maintenance(&self) -> Result<(), CacheError> {
        self.local.perform_maintenance()
    }

    fn materialize_local(
        &self,
        digest: &Digest,
        entry: &CacheEntry,
        expected_files: &ExpectedFiles,
        allow_hard_links: bool,
        create_target_dirs: bool,
    ) -> Result<(), CacheError> {
        let compressed = entry.compression_mode.is_compressed();
        for (file_id, expected_file) in expected_files {
            if entry.has_file(file_id) {
                if create_target_dirs {
                    create_parent_dirs(&expected_file.path)?;
                }
                self.local.get_file(
                    digest,
                    file_id,
                    &expected_file.path,
                    compressed,
                    allow_hard_links,
                )?;
            } else if expected_file.required {
                return Err(CacheError::CorruptEntry {
                    digest: digest.to_hex(),
                    reason: format!("required file id {file_id} not captured"),
                });
            } else {
                // The optional artifact was absent at capture time; it must
                // be absent after replay too.
                remove_if_present(&expected_file.path)?;
            }
        }
        Ok(())
    }

    fn materialize_remote(
        &self,
        digest: &Digest,
        entry: &CacheEntry,
        expected_files: &ExpectedFiles,
        create_target_dirs: bool,
    ) -> Result<(), CacheError> {
        let compressed = entry.compression_mode.is_compressed();
        let mut remote = self.remote.lock().unwrap_or_else(|e| e.into_inner());
        for (file_id, expected_file) in expected_files {
            if entry.has_file(file_id) {
                if create_target_dirs {
                    create_parent_dirs(&expected_file.path)?;
                }
                remote.get_file(digest, file_id, &expected_file.path, compressed)?;
            } else if expected_file.required {
                return Err(CacheError::CorruptEntry {
                    digest: digest.to_hex(),
                    reason: format!("required file id {file_id} not in remote entry"),
                });
            } else {
                remove_if_present(&expected_file.path)?;
            }
        }
        Ok(())
    }

    /// Copy a freshly downloaded remote hit into the local store. Best
    /// effort: the hit already succeeded.
    fn populate_local(&self, digest: &Digest, entry: &CacheEntry, expected_files: &ExpectedFiles) {
        if let Err(err) = self
            .local
            .add(digest, entry, expected_files, false, &self.pool)
        {
            tracing::error!(
                target = "kiln.cache",
                digest = %digest,
                error = %err,
                "failed to populate local store from remote hit"
            );
        }
    }

    fn record(&self, delta: CacheStats) {
        if let Err(err) = self.local.add_stats_delta(&delta) {
            tracing::debug!(
                target = "kiln.cache",
                error = %err,
                "failed to update cache statistics"
            );
        }
    }
}

fn create_parent_dirs(path: &Path) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
