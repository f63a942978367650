//! Core shared definitions for Kiln.
//!
//! This crate is intentionally small and dependency-free.

use std::time::{SystemTime, UNIX_EPOCH};

/// The Kiln version string.
///
/// Persisted cache entries are stamped with this version and treated as
/// misses when it changes, so derived data never crosses tool versions.
pub const KILN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the Unix epoch.
///
/// A system clock set before 1970 yields 0 rather than panicking; cache
/// entries written under such a clock simply look ancient and expire.
pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Milliseconds since the Unix epoch for an arbitrary [`SystemTime`].
///
/// Same pre-epoch behavior as [`now_millis`].
pub fn system_time_millis(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}
