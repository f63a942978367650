//! Persistent build cache for Kiln.
//!
//! [`BuildCache`] memoizes expensive, deterministic build sub-steps (asset
//! transforms, bundled output, anything serializable) keyed by a content
//! digest of the caller's key. It is a two-tier store:
//!
//! - an in-memory mirror that gives read-your-writes within the process and
//!   keeps serving entries even when the disk tier is unavailable;
//! - a flat on-disk directory with one JSON file per entry, shared across
//!   processes on a last-writer-wins basis.
//!
//! All reads are fail-safe: corruption, version mismatches, expired entries,
//! and I/O errors degrade to cache misses rather than surfacing errors to
//! the build. Disk usage is bounded by an oldest-first eviction pass and a
//! TTL sweep; see [`CachePolicy`].

mod entry;
mod error;
mod fingerprint;
mod store;
mod util;

pub use error::{CacheError, Result};
pub use fingerprint::Fingerprint;
pub use store::{serialized_key, BuildCache, CacheConfig, CachePolicy, CacheStats};
pub use util::atomic_write;
