use crate::error::CacheError;
use fs2::FileExt as _;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A filesystem-backed advisory lock shared across all kiln processes.
///
/// Lookups take the lock in shared mode; inserts, eviction, clearing and
/// statistics updates take it exclusively. The lock is filesystem-level so a
/// crashed process can never leave the cache wedged — the OS releases it on
/// exit. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
}

impl CacheLock {
    /// Acquire the lock in shared (reader) mode, blocking until available.
    pub fn shared(path: &Path) -> Result<Self, CacheError> {
        let file = Self::open(path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }

    /// Acquire the lock exclusively, blocking until available.
    pub fn exclusive(path: &Path) -> Result<Self, CacheError> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    fn open(path: &Path) -> Result<File, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?)
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");
        let _a = CacheLock::shared(&path).unwrap();
        let _b = CacheLock::shared(&path).unwrap();
    }

    #[test]
    fn exclusive_lock_is_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");
        drop(CacheLock::exclusive(&path).unwrap());
        let _again = CacheLock::exclusive(&path).unwrap();
    }
}
