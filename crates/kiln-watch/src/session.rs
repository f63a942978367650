//! The rebuild coordinator.
//!
//! [`WatchSession`] owns a dedicated watcher thread running a single
//! `select!` loop over four signals: a stop request, incoming file changes,
//! the debounce deadline, and completion of the in-flight build. Because
//! every state transition happens between `select!` arms on that one thread,
//! the coordinator state needs no locks.
//!
//! The cycle per the loop:
//!
//! 1. Each change event restarts the debounce deadline (trailing edge, so a
//!    burst of saves collapses to one action) and records the changed path.
//! 2. When the deadline fires while a build is in flight, the change is
//!    remembered as a pending retrigger instead of starting a second build.
//! 3. Otherwise the changed file is polled for write stability; a file that
//!    never settles aborts the attempt with a warning.
//! 4. A stable snapshot byte-identical to the one that produced the last
//!    build is skipped outright.
//! 5. Anything else starts the build on a worker thread; completion is
//!    observed back in the loop, where success broadcasts a reload event and
//!    a pending retrigger re-enters the debounce cycle from the top, so the
//!    stability and idempotence checks always re-run before another build.
//!
//! Stopping cancels the debounce deadline, waits for the in-flight build to
//! finish, and only then drops the watcher, so nothing writes to disk after
//! `stop` returns.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;

use kiln_reload::{ReloadEvent, ReloadNotifier};

use crate::executor::{BuildError, BuildExecutor, BuildOutput};
use crate::stability::{wait_for_stable, FileSnapshot};
use crate::watch::FileWatcher;

/// Timing knobs for a watch session.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Trailing-edge debounce window: each change event restarts it.
    pub debounce: Duration,
    /// How long a changed file may keep churning before the rebuild attempt
    /// is abandoned.
    pub stability_timeout: Duration,
    /// Interval between stability polls.
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            stability_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Deadline arm timeout when no debounce is pending.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A running watch session.
///
/// Dropping the handle stops the session the same way [`stop`] does.
///
/// [`stop`]: WatchSession::stop
pub struct WatchSession {
    stop_tx: channel::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WatchSession {
    /// Starts watching `root` and rebuilding on change.
    ///
    /// This is the coordinator's only fallible entry point: failing to
    /// register the watch root (or spawn the watcher thread) surfaces to the
    /// operator. Everything after that degrades to log lines.
    pub fn start<W: FileWatcher + 'static>(
        mut watcher: W,
        root: impl Into<PathBuf>,
        executor: Arc<dyn BuildExecutor>,
        notifier: ReloadNotifier,
        options: WatchOptions,
    ) -> io::Result<Self> {
        let root = root.into();
        watcher.watch_root(&root)?;

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("kiln-watch".to_string())
            .spawn(move || run_loop(watcher, root, executor, notifier, options, stop_rx))?;

        Ok(Self {
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Stops the session: cancels any pending debounce, waits for the
    /// in-flight build (if any) to finish, then releases the watch handle.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CoordinatorState {
    debounce_deadline: Option<Instant>,
    changed_path: Option<PathBuf>,
    last_known_state: Option<FileSnapshot>,
    pending_retrigger: bool,
    building: bool,
}

type BuildCompletion = (Result<BuildOutput, BuildError>, Duration);

fn run_loop<W: FileWatcher>(
    watcher: W,
    root: PathBuf,
    executor: Arc<dyn BuildExecutor>,
    notifier: ReloadNotifier,
    options: WatchOptions,
    stop_rx: channel::Receiver<()>,
) {
    let watch_rx = watcher.receiver().clone();
    // One completion channel for the session; single-flight means at most one
    // message is ever outstanding. Keeping the sender here keeps the receiver
    // selectable even while no build is running.
    let (done_tx, done_rx) = channel::bounded::<BuildCompletion>(1);

    let mut state = CoordinatorState {
        debounce_deadline: None,
        changed_path: None,
        last_known_state: None,
        pending_retrigger: false,
        building: false,
    };

    tracing::info!(
        target = "kiln.watch",
        root = %root.display(),
        "watching for changes"
    );

    loop {
        let timeout = state
            .debounce_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TIMEOUT);
        let deadline_tick = channel::after(timeout);

        channel::select! {
            recv(stop_rx) -> _ => {
                state.debounce_deadline = None;
                drain_in_flight_build(&mut state, &done_rx, &notifier);
                break;
            }
            recv(watch_rx) -> message => {
                match message {
                    Ok(Ok(changes)) => {
                        for change in changes {
                            state.changed_path = Some(change.into_path());
                            state.debounce_deadline = Some(Instant::now() + options.debounce);
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(
                            target = "kiln.watch",
                            root = %root.display(),
                            error = %err,
                            "file watcher reported an error"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            target = "kiln.watch",
                            root = %root.display(),
                            "file watcher stream closed; stopping watch session"
                        );
                        drain_in_flight_build(&mut state, &done_rx, &notifier);
                        break;
                    }
                }
            }
            recv(done_rx) -> message => {
                let Ok((result, elapsed)) = message else { continue };
                finish_build(&mut state, result, elapsed, &notifier);
                if state.pending_retrigger {
                    // A change arrived mid-build. Re-enter the cycle from the
                    // debounce so stability and idempotence re-run before any
                    // follow-up build.
                    state.pending_retrigger = false;
                    state.debounce_deadline = Some(Instant::now() + options.debounce);
                }
            }
            recv(deadline_tick) -> _ => {
                if state.debounce_deadline.is_none() {
                    continue;
                }
                state.debounce_deadline = None;

                if state.building {
                    // Single-flight: remember the change, never overlap builds.
                    state.pending_retrigger = true;
                    continue;
                }

                let Some(path) = state.changed_path.clone() else {
                    continue;
                };
                match wait_for_stable(&path, options.stability_timeout, options.poll_interval) {
                    None => {
                        tracing::warn!(
                            target = "kiln.watch",
                            path = %path.display(),
                            timeout_ms = options.stability_timeout.as_millis() as u64,
                            "file did not stabilize; skipping this rebuild"
                        );
                    }
                    Some(snapshot) => {
                        let unchanged = state
                            .last_known_state
                            .as_ref()
                            .is_some_and(|previous| previous.same_content(&snapshot));
                        if unchanged {
                            tracing::debug!(
                                target = "kiln.watch",
                                path = %path.display(),
                                "content unchanged since last build; skipping rebuild"
                            );
                        } else {
                            state.last_known_state = Some(snapshot);
                            state.building =
                                spawn_build(Arc::clone(&executor), done_tx.clone());
                        }
                    }
                }
            }
        }
    }

    // Dropping the watcher releases the OS watch handle; by this point any
    // in-flight build has been drained, so nothing rebuilds after stop.
    drop(watcher);
    tracing::debug!(
        target = "kiln.watch",
        root = %root.display(),
        "watch session stopped"
    );
}

/// Runs the executor on a short-lived worker thread, reporting completion
/// through `done_tx`. Returns whether a build is actually in flight.
fn spawn_build(executor: Arc<dyn BuildExecutor>, done_tx: channel::Sender<BuildCompletion>) -> bool {
    tracing::debug!(target = "kiln.watch", "starting rebuild");
    let spawned = thread::Builder::new()
        .name("kiln-build".to_string())
        .spawn(move || {
            let started = Instant::now();
            let result = executor.build();
            let _ = done_tx.send((result, started.elapsed()));
        });
    match spawned {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(
                target = "kiln.watch",
                error = %err,
                "failed to spawn build worker; waiting for the next change"
            );
            false
        }
    }
}

/// Blocks until the in-flight build (if any) completes and processes its
/// result, so a stopping session never abandons a running build.
fn drain_in_flight_build(
    state: &mut CoordinatorState,
    done_rx: &channel::Receiver<BuildCompletion>,
    notifier: &ReloadNotifier,
) {
    if !state.building {
        return;
    }
    tracing::debug!(
        target = "kiln.watch",
        "waiting for in-flight build before stopping"
    );
    if let Ok((result, elapsed)) = done_rx.recv() {
        finish_build(state, result, elapsed, notifier);
    }
}

fn finish_build(
    state: &mut CoordinatorState,
    result: Result<BuildOutput, BuildError>,
    elapsed: Duration,
    notifier: &ReloadNotifier,
) {
    state.building = false;
    match result {
        Ok(output) => {
            tracing::info!(
                target = "kiln.watch",
                output_bytes = output.output_bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                "build finished"
            );
            notifier.broadcast(ReloadEvent::now());
        }
        Err(err) => {
            tracing::warn!(
                target = "kiln.watch",
                error = %err,
                elapsed_ms = elapsed.as_millis() as u64,
                "build failed; waiting for the next change"
            );
        }
    }
}
