use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_core::system_time_millis;

/// Bumped whenever the persisted entry layout changes; entries written
/// under a different schema are deleted on read or sweep.
pub(crate) const CACHE_SCHEMA_VERSION: u32 = 1;

/// On-disk form of a cache entry: a single JSON document per file.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedEntry {
    pub schema_version: u32,
    pub kiln_version: String,
    pub saved_at_millis: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PathBuf>,
    pub data: serde_json::Value,
}

/// Header-only view used by the sweep so it can age-check entries without
/// materializing their payloads.
#[derive(Debug, Deserialize)]
pub(crate) struct PersistedEntryHeader {
    pub schema_version: u32,
    pub kiln_version: String,
    pub saved_at_millis: u64,
    #[serde(default)]
    #[allow(dead_code)]
    pub dependencies: Vec<PathBuf>,
    #[allow(dead_code)]
    pub data: serde::de::IgnoredAny,
}

impl PersistedEntry {
    pub fn is_current_version(&self) -> bool {
        self.schema_version == CACHE_SCHEMA_VERSION && self.kiln_version == kiln_core::KILN_VERSION
    }
}

impl PersistedEntryHeader {
    pub fn is_current_version(&self) -> bool {
        self.schema_version == CACHE_SCHEMA_VERSION && self.kiln_version == kiln_core::KILN_VERSION
    }
}

/// In-memory mirror of a persisted entry.
#[derive(Debug, Clone)]
pub(crate) struct MemoryEntry {
    pub saved_at_millis: u64,
    pub size_bytes: u64,
    pub dependencies: Vec<PathBuf>,
    pub data: serde_json::Value,
}

/// Why an entry may no longer be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Freshness {
    Fresh,
    Expired,
    StaleDependency(PathBuf),
}

/// Validates an entry's TTL and dependency mtimes.
///
/// A dependency whose metadata cannot be read counts as stale: the entry
/// was derived from a file we can no longer vouch for.
pub(crate) fn entry_freshness(
    saved_at_millis: u64,
    dependencies: &[PathBuf],
    ttl_millis: u64,
    now_millis: u64,
) -> Freshness {
    if now_millis.saturating_sub(saved_at_millis) > ttl_millis {
        return Freshness::Expired;
    }
    for dep in dependencies {
        if dependency_is_stale(dep, saved_at_millis) {
            return Freshness::StaleDependency(dep.clone());
        }
    }
    Freshness::Fresh
}

fn dependency_is_stale(dep: &Path, saved_at_millis: u64) -> bool {
    let meta = match std::fs::metadata(dep) {
        Ok(meta) => meta,
        Err(_) => return true,
    };
    let modified = match meta.modified() {
        Ok(modified) => modified,
        Err(_) => return true,
    };
    system_time_millis(modified) > saved_at_millis
}
