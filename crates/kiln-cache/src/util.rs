use crate::error::CacheError;
use kiln_pool::IoWorker;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hard upper bound for an entry descriptor read from disk.
pub(crate) const MAX_DESCRIPTOR_LEN: u64 = 64 * 1024 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a fresh, uniquely named directory under `parent`.
pub(crate) fn create_unique_dir(parent: &Path, prefix: &str) -> Result<PathBuf, CacheError> {
    fs::create_dir_all(parent)?;
    let pid = std::process::id();
    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = parent.join(format!("{prefix}-{pid}-{counter}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Write `bytes` to `path` atomically (unique temp file + rename).
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    if let Err(err) = file.write_all(bytes) {
        drop(file);
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    drop(file);

    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists || path.exists() => {
            // On Windows, rename doesn't overwrite. Try remove + rename.
            let _ = fs::remove_file(path);
            match fs::rename(&tmp_path, path) {
                Ok(()) => Ok(()),
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path);
                    Err(err.into())
                }
            }
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(err.into())
        }
    }
}

/// Read a file fully, or `None` when it is absent or larger than `limit`.
pub(crate) fn read_file_limited(path: &Path, limit: u64) -> Option<Vec<u8>> {
    let meta = fs::metadata(path).ok()?;
    if meta.len() > limit {
        return None;
    }
    fs::read(path).ok()
}

/// Copy `source` to `dest`, handing the destination handle to the IO worker
/// so the close happens off the hot path.
pub(crate) fn copy_file(source: &Path, dest: &Path, io: &IoWorker) -> Result<(), CacheError> {
    let mut reader = File::open(source)?;
    let mut writer = File::create(dest)?;
    io::copy(&mut reader, &mut writer)?;
    io.defer_close(writer);
    Ok(())
}

/// Write `bytes` to `dest`, deferring the close to the IO worker.
pub(crate) fn write_file(dest: &Path, bytes: &[u8], io: &IoWorker) -> Result<(), CacheError> {
    let mut writer = File::create(dest)?;
    writer.write_all(bytes)?;
    io.defer_close(writer);
    Ok(())
}

/// Recursively delete `path` without following symlinks.
pub(crate) fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() || meta.file_type().is_symlink() {
        return remove_file_best_effort(path);
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            remove_file_best_effort(entry.path())?;
        }
    }
    Ok(())
}

fn remove_file_best_effort(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
