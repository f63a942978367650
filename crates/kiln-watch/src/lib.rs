//! Watch mode for Kiln: rebuild on change, without redundant work.
//!
//! The pieces, leaves first:
//!
//! - [`FileWatcher`] is the OS-integration boundary: a trait over a channel
//!   of batched [`FileChange`]s, with a deterministic [`ManualFileWatcher`]
//!   for tests and a `notify`-backed implementation behind the
//!   `watch-notify` feature.
//! - [`wait_for_stable`] polls a changed file until its observable state
//!   stops changing, so a rebuild never runs on a half-written file.
//! - [`WatchSession`] is the rebuild coordinator: trailing-edge debounce of
//!   change bursts, a single-flight guard around the [`BuildExecutor`], an
//!   idempotence fingerprint so re-saving identical content does no work,
//!   and a reload broadcast after every successful build.
//!
//! Everything runs on one dedicated watcher thread; events, the debounce
//! deadline, and build completion are serialized through a single `select!`
//! loop, so coordinator state needs no locking. Builds themselves run on a
//! short-lived worker thread and only their completion is observed.

mod executor;
mod session;
mod stability;
mod watch;

pub use executor::{BuildError, BuildExecutor, BuildOutput};
pub use session::{WatchOptions, WatchSession};
pub use stability::{wait_for_stable, FileSnapshot};
pub use watch::{FileChange, FileWatcher, ManualFileWatcher, ManualFileWatcherHandle, WatchMode};

#[cfg(feature = "watch-notify")]
pub use watch::NotifyFileWatcher;

/// Messages delivered by a [`FileWatcher`]: a batch of changes, or an error
/// the backend surfaced asynchronously.
pub type WatchMessage = std::io::Result<Vec<FileChange>>;
