use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CacheError;

/// Hard upper bound for any cache entry file we will attempt to read.
///
/// Cache corruption should degrade to a cache miss, not an out-of-memory
/// crash. Large enough for any realistic bundled-output payload, small
/// enough that a corrupted or adversarial file cannot request an enormous
/// allocation.
pub(crate) const ENTRY_PAYLOAD_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Reads a cache entry file, refusing symlinks and oversize payloads.
///
/// Returns `None` on any failure; only unexpected errors are logged
/// (misses are normal).
pub(crate) fn read_file_limited(path: &Path) -> Option<Vec<u8>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache file"
                );
            }
            return None;
        }
    };
    if meta.file_type().is_symlink() || !meta.is_file() {
        remove_file_best_effort(path, "read_file_limited.invalid_type");
        return None;
    }
    if meta.len() > ENTRY_PAYLOAD_LIMIT_BYTES {
        remove_file_best_effort(path, "read_file_limited.oversize");
        return None;
    }

    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache file"
                );
            }
            None
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "kiln.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes `bytes` to `path` via a unique sibling tempfile and rename, so
/// concurrent readers never observe a partially written entry.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<(), CacheError> {
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        drop(file);
        cleanup_tmp(&tmp_path);
        return Err(err);
    }
    drop(file);

    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            cleanup_tmp(&tmp_path);
            Err(CacheError::from(err))
        }
    }
}

fn cleanup_tmp(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(
                target = "kiln.cache",
                path = %tmp_path.display(),
                error = %err,
                "failed to remove temporary file after failed write"
            );
        }
    }
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
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
