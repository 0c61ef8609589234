use crate::error::CacheError;
use crate::util;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Accumulated hit/miss counters, persisted as a JSON sidecar in the cache
/// root so they survive across invocations and are human-inspectable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    #[serde(default)]
    pub local_hits: u64,
    #[serde(default)]
    pub local_misses: u64,
    #[serde(default)]
    pub remote_hits: u64,
    #[serde(default)]
    pub remote_misses: u64,
}

impl CacheStats {
    pub fn local_hit() -> Self {
        Self {
            local_hits: 1,
            ..Self::default()
        }
    }

    pub fn local_miss() -> Self {
        Self {
            local_misses: 1,
            ..Self::default()
        }
    }

    pub fn remote_hit() -> Self {
        Self {
            remote_hits: 1,
            ..Self::default()
        }
    }

    pub fn remote_miss() -> Self {
        Self {
            remote_misses: 1,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, delta: &CacheStats) {
        self.local_hits = self.local_hits.saturating_add(delta.local_hits);
        self.local_misses = self.local_misses.saturating_add(delta.local_misses);
        self.remote_hits = self.remote_hits.saturating_add(delta.remote_hits);
        self.remote_misses = self.remote_misses.saturating_add(delta.remote_misses);
    }

    pub fn total_hits(&self) -> u64 {
        self.local_hits.saturating_add(self.remote_hits)
    }

    pub fn total_misses(&self) -> u64 {
        // Every remote miss was also a local miss; count each invocation once.
        self.local_misses
    }

    /// Load persisted counters; absent or corrupt files read as zeroes.
    pub(crate) fn load(path: &Path) -> Self {
        let Some(bytes) = util::read_file_limited(path, 64 * 1024) else {
            return Self::default();
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            tracing::error!(
                target = "kiln.cache",
                path = %path.display(),
                error = %err,
                "failed to parse cache statistics, resetting"
            );
            Self::default()
        })
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(self).map_err(|err| CacheError::Stats {
            message: err.to_string(),
        })?;
        util::atomic_write(path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates() {
        let mut stats = CacheStats::default();
        stats.merge(&CacheStats::local_hit());
        stats.merge(&CacheStats::local_hit());
        stats.merge(&CacheStats::local_miss());
        stats.merge(&CacheStats::remote_hit());
        assert_eq!(stats.local_hits, 2);
        assert_eq!(stats.local_misses, 1);
        assert_eq!(stats.total_hits(), 3);
        assert_eq!(stats.total_misses(), 1);
    }

    #[test]
    fn load_save_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stats.json");

        assert_eq!(CacheStats::load(&path), CacheStats::default());

        let stats = CacheStats {
            local_hits: 7,
            local_misses: 3,
            remote_hits: 1,
            remote_misses: 2,
        };
        stats.save(&path).unwrap();
        assert_eq!(CacheStats::load(&path), stats);
    }

    #[test]
    fn corrupt_stats_read_as_zeroes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stats.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert_eq!(CacheStats::load(&path), CacheStats::default());
    }
}
