//! File watching.
//!
//! This module owns all operating-system integration for file watching.
//! The coordinator depends only on the [`FileWatcher`] trait and the
//! [`FileChange`] model:
//!
//! - The OS backend (a `notify`-based implementation) lives behind the
//!   `watch-notify` feature so the platform watcher dependency stays out of
//!   the default build. Binaries that need real OS watching enable the
//!   feature; library consumers and tests do not.
//! - Recursion semantics are represented by [`WatchMode`] so downstream code
//!   never sees backend-specific enums like `notify::RecursiveMode`.
//!
//! Backends may batch, coalesce, or drop events; the OS offers no better
//! guarantee. Consumers treat events as hints and re-read file contents when
//! it matters; the stability detector always re-reads at debounce-fire
//! time, which is what makes a lossy stream acceptable here.
//!
//! # Testing
//!
//! Avoid tests that rely on real OS watcher timing; they are flaky on CI and
//! across platforms. Use [`ManualFileWatcher`] and inject events instead.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use crossbeam_channel as channel;

use crate::WatchMessage;

/// A normalized file-system change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

impl FileChange {
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Created(path) | FileChange::Modified(path) | FileChange::Deleted(path) => {
                path
            }
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            FileChange::Created(path) | FileChange::Modified(path) | FileChange::Deleted(path) => {
                path
            }
        }
    }
}

/// Controls whether a directory watch should recurse into subdirectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMode {
    /// Watch the given directory and all descendants.
    Recursive,
    /// Only watch the given path itself.
    NonRecursive,
}

/// Event-driven watcher abstraction.
///
/// Consumers register paths with [`watch_path`](FileWatcher::watch_path)
/// (or [`watch_root`](FileWatcher::watch_root) for recursive roots) and
/// consume batches from [`receiver`](FileWatcher::receiver). Backends may
/// surface errors asynchronously on the same stream.
pub trait FileWatcher: Send {
    /// Begin watching `path`. For file paths, `mode` is treated as
    /// [`WatchMode::NonRecursive`] since recursion is not meaningful.
    fn watch_path(&mut self, path: &Path, mode: WatchMode) -> io::Result<()>;

    /// Stop watching `path`.
    fn unwatch_path(&mut self, path: &Path) -> io::Result<()>;

    /// Returns the receiver used to consume watcher events.
    fn receiver(&self) -> &channel::Receiver<WatchMessage>;

    /// Convenience wrapper for watching a directory root recursively.
    fn watch_root(&mut self, root: &Path) -> io::Result<()> {
        self.watch_path(root, WatchMode::Recursive)
    }

    /// Convenience wrapper for unwatching a directory root.
    fn unwatch_root(&mut self, root: &Path) -> io::Result<()> {
        self.unwatch_path(root)
    }
}

const MANUAL_WATCH_QUEUE_CAPACITY: usize = 1024;

/// Deterministic watcher implementation for tests.
///
/// Does not interact with the OS: callers inject events via
/// [`ManualFileWatcher::push`] or a cloneable [`ManualFileWatcherHandle`]
/// (useful after the watcher has been moved into a watch session).
#[derive(Debug)]
pub struct ManualFileWatcher {
    tx: channel::Sender<WatchMessage>,
    rx: channel::Receiver<WatchMessage>,
    watch_calls: Vec<(PathBuf, WatchMode)>,
    unwatch_calls: Vec<PathBuf>,
    watched: HashMap<PathBuf, WatchMode>,
}

/// Cloneable handle for injecting events into a [`ManualFileWatcher`].
#[derive(Debug, Clone)]
pub struct ManualFileWatcherHandle {
    tx: channel::Sender<WatchMessage>,
}

impl ManualFileWatcherHandle {
    /// Inject a batch of synthetic changes.
    pub fn push(&self, changes: Vec<FileChange>) -> io::Result<()> {
        self.send(Ok(changes))
    }

    /// Inject an asynchronous watcher error.
    pub fn push_error(&self, error: io::Error) -> io::Result<()> {
        self.send(Err(error))
    }

    fn send(&self, message: WatchMessage) -> io::Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(channel::TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "watch queue is full",
            )),
            Err(channel::TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "watch receiver dropped",
            )),
        }
    }
}

impl Default for ManualFileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualFileWatcher {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(MANUAL_WATCH_QUEUE_CAPACITY);
        Self {
            tx,
            rx,
            watch_calls: Vec::new(),
            unwatch_calls: Vec::new(),
            watched: HashMap::new(),
        }
    }

    /// Returns a handle that keeps working after the watcher is moved into
    /// another thread.
    pub fn handle(&self) -> ManualFileWatcherHandle {
        ManualFileWatcherHandle {
            tx: self.tx.clone(),
        }
    }

    /// Inject a batch of synthetic changes.
    pub fn push(&self, changes: Vec<FileChange>) -> io::Result<()> {
        self.handle().push(changes)
    }

    /// Paths passed to [`FileWatcher::watch_path`] (in call order).
    pub fn watch_calls(&self) -> &[(PathBuf, WatchMode)] {
        &self.watch_calls
    }

    /// Paths passed to [`FileWatcher::unwatch_path`] (in call order).
    pub fn unwatch_calls(&self) -> &[PathBuf] {
        &self.unwatch_calls
    }

    /// Currently watched paths, sorted for determinism.
    pub fn watched_paths(&self) -> Vec<(PathBuf, WatchMode)> {
        let mut out: Vec<(PathBuf, WatchMode)> =
            self.watched.iter().map(|(p, m)| (p.clone(), *m)).collect();
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        out
    }
}

impl FileWatcher for ManualFileWatcher {
    fn watch_path(&mut self, path: &Path, mode: WatchMode) -> io::Result<()> {
        let path = path.to_path_buf();
        self.watch_calls.push((path.clone(), mode));
        // Once a path is watched recursively, do not silently downgrade it to
        // non-recursive on subsequent calls.
        let mode = match self.watched.get(&path) {
            Some(existing) if *existing == WatchMode::Recursive || mode == WatchMode::Recursive => {
                WatchMode::Recursive
            }
            Some(_) => WatchMode::NonRecursive,
            None => mode,
        };
        self.watched.insert(path, mode);
        Ok(())
    }

    fn unwatch_path(&mut self, path: &Path) -> io::Result<()> {
        let path = path.to_path_buf();
        self.unwatch_calls.push(path.clone());
        self.watched.remove(&path);
        Ok(())
    }

    fn receiver(&self) -> &channel::Receiver<WatchMessage> {
        &self.rx
    }
}

#[cfg(feature = "watch-notify")]
mod notify_impl {
    use super::*;
    use notify::Watcher;

    const NOTIFY_QUEUE_CAPACITY: usize = 1024;

    /// OS-backed watcher using `notify`'s recommended platform backend.
    pub struct NotifyFileWatcher {
        watcher: notify::RecommendedWatcher,
        rx: channel::Receiver<WatchMessage>,
    }

    impl NotifyFileWatcher {
        pub fn new() -> io::Result<Self> {
            let (tx, rx) = channel::bounded(NOTIFY_QUEUE_CAPACITY);
            let watcher = notify::recommended_watcher(
                move |result: notify::Result<notify::Event>| {
                    let message: WatchMessage = match result {
                        Ok(event) => Ok(convert_event(event)),
                        Err(err) => Err(into_io_error(err)),
                    };
                    // Dropping on overflow is safe: the stream is a hint and
                    // the stability detector re-reads file contents anyway.
                    let _ = tx.try_send(message);
                },
            )
            .map_err(into_io_error)?;
            Ok(Self { watcher, rx })
        }
    }

    impl FileWatcher for NotifyFileWatcher {
        fn watch_path(&mut self, path: &Path, mode: WatchMode) -> io::Result<()> {
            let mode = match mode {
                WatchMode::Recursive => notify::RecursiveMode::Recursive,
                WatchMode::NonRecursive => notify::RecursiveMode::NonRecursive,
            };
            self.watcher.watch(path, mode).map_err(into_io_error)
        }

        fn unwatch_path(&mut self, path: &Path) -> io::Result<()> {
            self.watcher.unwatch(path).map_err(into_io_error)
        }

        fn receiver(&self) -> &channel::Receiver<WatchMessage> {
            &self.rx
        }
    }

    fn convert_event(event: notify::Event) -> Vec<FileChange> {
        let kind = event.kind;
        event
            .paths
            .into_iter()
            .map(|path| match kind {
                notify::EventKind::Create(_) => FileChange::Created(path),
                notify::EventKind::Remove(_) => FileChange::Deleted(path),
                _ => FileChange::Modified(path),
            })
            .collect()
    }

    fn into_io_error(err: notify::Error) -> io::Error {
        match err {
            notify::Error {
                kind: notify::ErrorKind::Io(io_err),
                ..
            } => io_err,
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(feature = "watch-notify")]
pub use notify_impl::NotifyFileWatcher;
