//! Write-stability detection.
//!
//! Editors and build tools often write files in several chunks; reacting to
//! the first change event risks compiling truncated or syntactically invalid
//! content. [`wait_for_stable`] polls a file until its observable state has
//! stopped changing before the coordinator is allowed to build from it.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use sha2::{Digest, Sha256};

/// Observations that must be identical in a row before a file counts as
/// fully written.
const REQUIRED_CONSECUTIVE_POLLS: u32 = 3;

/// Fingerprint of a file's observable state at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub content_digest: [u8; 32],
    pub len: u64,
    pub mtime: SystemTime,
}

impl FileSnapshot {
    /// Reads and digests the file's current state.
    pub fn capture(path: &Path) -> io::Result<Self> {
        let content = fs::read(path)?;
        let meta = fs::metadata(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(Self {
            content_digest: hasher.finalize().into(),
            len: content.len() as u64,
            mtime: meta.modified()?,
        })
    }

    /// True when `other` holds byte-identical content.
    ///
    /// Deliberately ignores `mtime`: re-saving a file with unchanged bytes
    /// updates its timestamp but must still count as "same content".
    pub fn same_content(&self, other: &FileSnapshot) -> bool {
        self.len == other.len && self.content_digest == other.content_digest
    }
}

/// Polls `path` every `poll_interval` until three consecutive observations
/// are identical in content, size, and mtime, then returns the snapshot.
///
/// Returns `None` if `timeout` elapses first; the caller must treat that as
/// "could not verify" and abort the rebuild attempt, never build anyway. An
/// I/O error during a poll resets the streak instead of aborting: transient
/// failures (a mid-write lock, a momentarily missing file during an atomic
/// save) are expected while an editor is still flushing.
pub fn wait_for_stable(
    path: &Path,
    timeout: Duration,
    poll_interval: Duration,
) -> Option<FileSnapshot> {
    let started = Instant::now();
    let mut streak = 0_u32;
    let mut last: Option<FileSnapshot> = None;

    loop {
        match FileSnapshot::capture(path) {
            Ok(snapshot) => {
                if last.as_ref() == Some(&snapshot) {
                    streak += 1;
                } else {
                    streak = 1;
                    last = Some(snapshot);
                }
                if streak >= REQUIRED_CONSECUTIVE_POLLS {
                    return last;
                }
            }
            Err(err) => {
                tracing::debug!(
                    target = "kiln.watch",
                    path = %path.display(),
                    error = %err,
                    "transient error while polling for stability"
                );
                streak = 0;
                last = None;
            }
        }

        if started.elapsed() >= timeout {
            return None;
        }
        thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn quiet_file_stabilizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        fs::write(&path, "<html></html>").unwrap();

        let snapshot = wait_for_stable(&path, Duration::from_secs(2), POLL)
            .expect("an untouched file must stabilize");
        assert_eq!(snapshot.len, "<html></html>".len() as u64);
    }

    #[test]
    fn missing_file_never_stabilizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.html");

        let started = Instant::now();
        let result = wait_for_stable(&path, Duration::from_millis(120), POLL);
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn continuously_rewritten_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("churn.js");
        fs::write(&path, "0").unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..60 {
                let _ = fs::write(&writer_path, format!("content {i}"));
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let result = wait_for_stable(&path, Duration::from_millis(200), Duration::from_millis(15));
        writer.join().unwrap();
        assert!(result.is_none(), "a churning file must not stabilize");
    }

    #[test]
    fn file_that_settles_after_churn_stabilizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.css");
        fs::write(&path, "partial").unwrap();

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..5 {
                let _ = fs::write(&writer_path, format!("chunk {i}"));
                std::thread::sleep(Duration::from_millis(10));
            }
            fs::write(&writer_path, "final content").unwrap();
        });

        let snapshot = wait_for_stable(&path, Duration::from_secs(3), POLL)
            .expect("file settles once the writer finishes");
        writer.join().unwrap();
        assert_eq!(snapshot.len, "final content".len() as u64);
    }

    #[test]
    fn same_content_ignores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same.txt");
        fs::write(&path, "identical").unwrap();
        let first = FileSnapshot::capture(&path).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        fs::write(&path, "identical").unwrap();
        let second = FileSnapshot::capture(&path).unwrap();

        assert!(first.same_content(&second));
        assert_ne!(first, second, "the mtime should have moved");
    }

    #[test]
    fn different_content_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diff.txt");
        fs::write(&path, "one").unwrap();
        let first = FileSnapshot::capture(&path).unwrap();
        fs::write(&path, "two").unwrap();
        let second = FileSnapshot::capture(&path).unwrap();

        assert!(!first.same_content(&second));
    }
}
