use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;

use kiln_core::now_millis;

use crate::entry::{
    entry_freshness, Freshness, MemoryEntry, PersistedEntry, PersistedEntryHeader,
    CACHE_SCHEMA_VERSION,
};
use crate::fingerprint::Fingerprint;
use crate::util::{read_file_limited, remove_file_best_effort};

/// File extension for persisted cache entries.
const ENTRY_EXT: &str = "json";

/// Retention policy for the on-disk tier.
#[derive(Clone, Copy, Debug)]
pub struct CachePolicy {
    /// Maximum total size of entry files on disk. Eviction brings usage down
    /// to 80% of this so it doesn't run again on every subsequent write.
    pub max_bytes: u64,
    /// Time-to-live for entries, measured from the persisted
    /// `saved_at_millis`.
    pub ttl_millis: u64,
    /// Minimum time between TTL sweeps triggered by writes.
    pub sweep_interval_millis: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        // Conservative defaults:
        // - 500MB bounds disk usage even with large bundled outputs.
        // - 7 days of TTL keeps warm-start value without growing forever.
        // - The sweep interval avoids re-scanning the directory on every write.
        Self {
            max_bytes: 500 * 1024 * 1024,
            ttl_millis: 7 * 24 * 60 * 60 * 1000,
            sweep_interval_millis: 5 * 60 * 1000,
        }
    }
}

/// Configuration surface for [`BuildCache`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// When false the cache is a no-op for the whole process.
    pub enabled: bool,
    /// Directory holding one file per entry, created on startup if absent.
    pub directory: PathBuf,
    pub policy: CachePolicy,
}

impl CacheConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            directory: directory.into(),
            policy: CachePolicy::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(".kiln/cache")
    }
}

/// Read-only snapshot of the store for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub enabled: bool,
    pub entry_count: usize,
    pub size_bytes: u64,
    pub directory: Option<PathBuf>,
}

/// Derives a cache key from any serializable value.
///
/// Callers memoizing a computation over a structured input (a config, a list
/// of transform options) can use this instead of building a key string by
/// hand. Returns `None` when the value does not serialize.
pub fn serialized_key<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

/// Two-tier (memory + disk) content-keyed build cache.
///
/// Construction never fails: if the cache directory cannot be created the
/// store is disabled for the process lifetime and every operation becomes a
/// safe no-op that reports a miss.
pub struct BuildCache {
    inner: Option<Inner>,
}

struct Inner {
    directory: PathBuf,
    policy: CachePolicy,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    /// Total bytes of live entry files on disk. Recomputed by every sweep and
    /// eviction pass, maintained incrementally in between.
    tracked_bytes: AtomicU64,
    last_sweep_millis: AtomicU64,
}

impl BuildCache {
    pub fn new(config: CacheConfig) -> Self {
        if !config.enabled {
            tracing::debug!(target = "kiln.cache", "cache disabled by configuration");
            return Self { inner: None };
        }
        if let Err(err) = fs::create_dir_all(&config.directory) {
            tracing::warn!(
                target = "kiln.cache",
                directory = %config.directory.display(),
                error = %err,
                "failed to create cache directory; caching disabled for this process"
            );
            return Self { inner: None };
        }

        let inner = Inner {
            directory: config.directory,
            policy: config.policy,
            memory: Mutex::new(HashMap::new()),
            tracked_bytes: AtomicU64::new(0),
            last_sweep_millis: AtomicU64::new(now_millis()),
        };
        // Startup sweep: drops expired/foreign/corrupt entries and leftover
        // tempfiles, and recomputes `tracked_bytes` from what remains.
        inner.sweep();
        Self { inner: Some(inner) }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Looks up a cached value: memory first, then disk.
    ///
    /// Expired entries and entries with stale dependencies are deleted from
    /// both tiers and reported as misses. A disk hit repopulates the memory
    /// mirror. Never errors; I/O failures count as misses.
    pub fn get<T: DeserializeOwned>(&self, prefix: Option<&str>, key: &str) -> Option<T> {
        let inner = self.inner.as_ref()?;
        let name = entry_name(prefix, key);
        let now = now_millis();

        if let Some(found) = inner.get_from_memory(&name, now) {
            return match found {
                Some(data) => decode_data(&name, data),
                None => None,
            };
        }

        let data = inner.get_from_disk(&name, now)?;
        decode_data(&name, data)
    }

    /// Stores a value, optionally recording dependency paths whose later
    /// modification invalidates the entry.
    ///
    /// The memory tier is written first so a reader an instant later sees the
    /// value even if the disk write fails; a failed disk write degrades the
    /// entry to process-local.
    pub fn set<T: Serialize>(
        &self,
        prefix: Option<&str>,
        key: &str,
        value: &T,
        dependencies: &[PathBuf],
    ) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let name = entry_name(prefix, key);

        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(
                    target = "kiln.cache",
                    key = %name,
                    error = %err,
                    "value does not serialize; not caching"
                );
                return;
            }
        };
        let persisted = PersistedEntry {
            schema_version: CACHE_SCHEMA_VERSION,
            kiln_version: kiln_core::KILN_VERSION.to_string(),
            saved_at_millis: now_millis(),
            dependencies: dependencies.to_vec(),
            data,
        };
        let bytes = match serde_json::to_vec(&persisted) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    target = "kiln.cache",
                    key = %name,
                    error = %err,
                    "failed to encode cache entry; not caching"
                );
                return;
            }
        };

        {
            let mut memory = inner.memory.lock().expect("cache memory mutex poisoned");
            memory.insert(
                name.clone(),
                MemoryEntry {
                    saved_at_millis: persisted.saved_at_millis,
                    size_bytes: bytes.len() as u64,
                    dependencies: persisted.dependencies,
                    data: persisted.data,
                },
            );
        }

        let path = inner.entry_path(&name);
        let previous_len = file_len(&path);
        match crate::util::atomic_write(&path, &bytes) {
            Ok(()) => {
                inner.adjust_tracked(bytes.len() as u64, previous_len);
                inner.maybe_sweep();
                if inner.tracked_bytes.load(Ordering::Relaxed) > inner.policy.max_bytes {
                    inner.evict();
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "kiln.cache",
                    key = %name,
                    path = %path.display(),
                    error = %err,
                    "failed to persist cache entry; serving it from memory only"
                );
            }
        }
    }

    /// Removes a single entry from both tiers. Safe no-op when disabled.
    pub fn invalidate(&self, prefix: Option<&str>, key: &str) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let name = entry_name(prefix, key);
        inner
            .memory
            .lock()
            .expect("cache memory mutex poisoned")
            .remove(&name);
        inner.remove_entry_file(&name);
    }

    /// Removes every entry written under `prefix` from both tiers.
    pub fn clear_prefix(&self, prefix: &str) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let marker = format!("{prefix}-");
        inner
            .memory
            .lock()
            .expect("cache memory mutex poisoned")
            .retain(|name, _| !name.starts_with(&marker));

        for name in inner.entry_names() {
            if name.starts_with(&marker) {
                inner.remove_entry_file(&name);
            }
        }
    }

    /// Removes every entry from both tiers.
    pub fn clear(&self) {
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        inner
            .memory
            .lock()
            .expect("cache memory mutex poisoned")
            .clear();
        for name in inner.entry_names() {
            inner.remove_entry_file(&name);
        }
        inner.tracked_bytes.store(0, Ordering::Relaxed);
    }

    /// Runs a TTL sweep now, regardless of the sweep interval.
    pub fn sweep(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.sweep();
        }
    }

    pub fn stats(&self) -> CacheStats {
        match self.inner.as_ref() {
            None => CacheStats {
                enabled: false,
                entry_count: 0,
                size_bytes: 0,
                directory: None,
            },
            Some(inner) => CacheStats {
                enabled: true,
                entry_count: inner.entry_names().len(),
                size_bytes: inner.tracked_bytes.load(Ordering::Relaxed),
                directory: Some(inner.directory.clone()),
            },
        }
    }
}

impl Inner {
    fn entry_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.{ENTRY_EXT}"))
    }

    /// Memory-tier lookup. `Some(Some(data))` is a fresh hit, `Some(None)` a
    /// stale hit (already purged), `None` a miss that should fall through to
    /// disk.
    fn get_from_memory(&self, name: &str, now: u64) -> Option<Option<serde_json::Value>> {
        let mut memory = self.memory.lock().expect("cache memory mutex poisoned");
        let entry = memory.get(name)?;
        match entry_freshness(
            entry.saved_at_millis,
            &entry.dependencies,
            self.policy.ttl_millis,
            now,
        ) {
            Freshness::Fresh => Some(Some(entry.data.clone())),
            reason => {
                memory.remove(name);
                drop(memory);
                self.remove_entry_file(name);
                log_stale(name, &reason);
                Some(None)
            }
        }
    }

    fn get_from_disk(&self, name: &str, now: u64) -> Option<serde_json::Value> {
        let path = self.entry_path(name);
        let bytes = read_file_limited(&path)?;
        let persisted: PersistedEntry = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::debug!(
                    target = "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "undecodable cache entry; deleting"
                );
                self.remove_entry_file(name);
                return None;
            }
        };
        if !persisted.is_current_version() {
            // Usable only by some other Kiln version; delete so stale caches
            // don't accumulate.
            self.remove_entry_file(name);
            return None;
        }
        match entry_freshness(
            persisted.saved_at_millis,
            &persisted.dependencies,
            self.policy.ttl_millis,
            now,
        ) {
            Freshness::Fresh => {}
            reason => {
                self.remove_entry_file(name);
                log_stale(name, &reason);
                return None;
            }
        }

        let mut memory = self.memory.lock().expect("cache memory mutex poisoned");
        let entry = memory.entry(name.to_string()).or_insert(MemoryEntry {
            saved_at_millis: persisted.saved_at_millis,
            size_bytes: bytes.len() as u64,
            dependencies: persisted.dependencies,
            data: persisted.data,
        });
        Some(entry.data.clone())
    }

    /// Deletes one entry file and subtracts its size from `tracked_bytes`.
    fn remove_entry_file(&self, name: &str) {
        let path = self.entry_path(name);
        let len = file_len(&path);
        if remove_file_best_effort(&path, "remove_entry_file") && len > 0 {
            self.sub_tracked(len);
        }
    }

    fn adjust_tracked(&self, new_len: u64, previous_len: u64) {
        if new_len >= previous_len {
            self.tracked_bytes
                .fetch_add(new_len - previous_len, Ordering::Relaxed);
        } else {
            self.sub_tracked(previous_len - new_len);
        }
    }

    fn sub_tracked(&self, delta: u64) {
        let _ = self
            .tracked_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    /// Names (file stems) of all entry files currently on disk.
    fn entry_names(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "kiln.cache",
                        directory = %self.directory.display(),
                        error = %err,
                        "failed to list cache directory"
                    );
                }
                return Vec::new();
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names
    }

    fn maybe_sweep(&self) {
        let now = now_millis();
        let last = self.last_sweep_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.policy.sweep_interval_millis {
            return;
        }
        if self
            .last_sweep_millis
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.sweep();
    }

    /// Deletes expired, foreign-version, and undecodable entries plus
    /// leftover tempfiles, prunes expired memory entries, and recomputes
    /// `tracked_bytes`.
    fn sweep(&self) {
        let now = now_millis();
        let mut total_bytes: u64 = 0;

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        target = "kiln.cache",
                        directory = %self.directory.display(),
                        error = %err,
                        "failed to sweep cache directory"
                    );
                }
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let file_type = meta.file_type();
            if !file_type.is_file() && !file_type.is_symlink() {
                continue;
            }

            // Only `.json` files are entries. Anything else (including
            // crashed atomic-write tempfiles) is a leftover to clean up.
            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXT) {
                if file_type.is_file() {
                    remove_file_best_effort(&path, "sweep.leftover");
                }
                continue;
            }

            let header = read_file_limited(&path)
                .and_then(|bytes| serde_json::from_slice::<PersistedEntryHeader>(&bytes).ok());
            let Some(header) = header else {
                remove_file_best_effort(&path, "sweep.undecodable");
                continue;
            };
            if !header.is_current_version() {
                remove_file_best_effort(&path, "sweep.foreign_version");
                continue;
            }
            if now.saturating_sub(header.saved_at_millis) > self.policy.ttl_millis {
                remove_file_best_effort(&path, "sweep.expired");
                continue;
            }

            total_bytes = total_bytes.saturating_add(meta.len());
        }

        self.tracked_bytes.store(total_bytes, Ordering::Relaxed);

        let ttl = self.policy.ttl_millis;
        self.memory
            .lock()
            .expect("cache memory mutex poisoned")
            .retain(|_, entry| now.saturating_sub(entry.saved_at_millis) <= ttl);
    }

    /// Deletes entry files oldest-first (by mtime) until disk usage is at or
    /// below 80% of `max_bytes`.
    ///
    /// FIFO-by-mtime, not true LRU: reads do not bump an entry. Hot-entry
    /// retention is the memory tier's job.
    fn evict(&self) {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    target = "kiln.cache",
                    directory = %self.directory.display(),
                    error = %err,
                    "failed to list cache directory for eviction"
                );
                return;
            }
        };

        let mut candidates: Vec<EvictionCandidate> = Vec::new();
        let mut total_bytes: u64 = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let len = meta.len();
            total_bytes = total_bytes.saturating_add(len);
            candidates.push(EvictionCandidate {
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                len,
                path,
            });
        }

        let target = self.policy.max_bytes / 5 * 4;
        let before_bytes = total_bytes;
        if total_bytes > self.policy.max_bytes {
            candidates.sort_by_key(|candidate| candidate.modified);
            let mut evicted_names = Vec::new();
            for candidate in &candidates {
                if total_bytes <= target {
                    break;
                }
                if fs::remove_file(&candidate.path).is_ok() {
                    total_bytes = total_bytes.saturating_sub(candidate.len);
                    if let Some(stem) = candidate.path.file_stem().and_then(|s| s.to_str()) {
                        evicted_names.push(stem.to_string());
                    }
                }
            }

            if !evicted_names.is_empty() {
                let mut memory = self.memory.lock().expect("cache memory mutex poisoned");
                for name in &evicted_names {
                    memory.remove(name);
                }
            }
            tracing::debug!(
                target = "kiln.cache",
                evicted = evicted_names.len(),
                before_bytes,
                after_bytes = total_bytes,
                "evicted oldest cache entries"
            );
        }

        self.tracked_bytes.store(total_bytes, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct EvictionCandidate {
    modified: SystemTime,
    len: u64,
    path: PathBuf,
}

/// Derives the entry file stem: the SHA-256 of `prefix ++ key`, with the
/// prefix kept visible in the name so prefix-scoped clears work directly on
/// file names. Distinct prefixes can never collide, even on identical keys.
///
/// Prefixes are expected to be short single-token namespace tags
/// (`"asset"`, `"transform"`), not arbitrary strings.
fn entry_name(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => {
            let fingerprint = Fingerprint::from_bytes(format!("{prefix}:{key}"));
            format!("{prefix}-{fingerprint}")
        }
        None => Fingerprint::from_bytes(key).to_string(),
    }
}

fn decode_data<T: DeserializeOwned>(name: &str, data: serde_json::Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(
                target = "kiln.cache",
                key = %name,
                error = %err,
                "cached value does not deserialize as the requested type; treating as miss"
            );
            None
        }
    }
}

fn log_stale(name: &str, reason: &Freshness) {
    match reason {
        Freshness::Fresh => {}
        Freshness::Expired => {
            tracing::debug!(target = "kiln.cache", key = %name, "cache entry expired");
        }
        Freshness::StaleDependency(dep) => {
            tracing::debug!(
                target = "kiln.cache",
                key = %name,
                dependency = %dep.display(),
                "cache entry invalidated by dependency change"
            );
        }
    }
}

fn file_len(path: &Path) -> u64 {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn make_cache(dir: &Path) -> BuildCache {
        BuildCache::new(CacheConfig::new(dir))
    }

    fn make_cache_with_policy(dir: &Path, policy: CachePolicy) -> BuildCache {
        let mut config = CacheConfig::new(dir);
        config.policy = policy;
        BuildCache::new(config)
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.set(None, "style.css", &"body { color: red }".to_string(), &[]);
        let value: Option<String> = cache.get(None, "style.css");
        assert_eq!(value.as_deref(), Some("body { color: red }"));
    }

    #[test]
    fn missing_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());
        assert_eq!(cache.get::<String>(None, "absent"), None);
    }

    #[test]
    fn prefixes_namespace_identical_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.set(Some("asset"), "logo.png", &1_u32, &[]);
        cache.set(Some("transform"), "logo.png", &2_u32, &[]);

        assert_eq!(cache.get::<u32>(Some("asset"), "logo.png"), Some(1));
        assert_eq!(cache.get::<u32>(Some("transform"), "logo.png"), Some(2));
        assert_eq!(cache.get::<u32>(None, "logo.png"), None);
    }

    #[test]
    fn insertion_overwrites_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.set(None, "k", &"first".to_string(), &[]);
        cache.set(None, "k", &"second".to_string(), &[]);

        assert_eq!(
            cache.get::<String>(None, "k").as_deref(),
            Some("second")
        );
        assert_eq!(cache.stats().entry_count, 1);
    }

    #[test]
    fn expired_entries_are_deleted_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache_with_policy(
            dir.path(),
            CachePolicy {
                ttl_millis: 20,
                ..CachePolicy::default()
            },
        );

        cache.set(None, "k", &42_u32, &[]);
        thread::sleep(Duration::from_millis(60));

        assert_eq!(cache.get::<u32>(None, "k"), None);
        assert_eq!(cache.stats().entry_count, 0, "expired entry file remains");
    }

    #[test]
    fn dependency_change_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        let dep = dir.path().join("tokens.css");
        fs::write(&dep, ":root {}").unwrap();

        cache.set(None, "compiled", &"v1".to_string(), &[dep.clone()]);
        assert_eq!(cache.get::<String>(None, "compiled").as_deref(), Some("v1"));

        // Ensure the rewrite lands at a strictly newer mtime.
        thread::sleep(Duration::from_millis(30));
        fs::write(&dep, ":root { --x: 1 }").unwrap();

        assert_eq!(cache.get::<String>(None, "compiled"), None);
    }

    #[test]
    fn missing_dependency_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        let dep = dir.path().join("tokens.css");
        fs::write(&dep, ":root {}").unwrap();
        cache.set(None, "compiled", &"v1".to_string(), &[dep.clone()]);

        fs::remove_file(&dep).unwrap();
        assert_eq!(cache.get::<String>(None, "compiled"), None);
    }

    #[test]
    fn eviction_keeps_usage_at_or_below_80_percent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache_with_policy(
            dir.path(),
            CachePolicy {
                max_bytes: 1000,
                ..CachePolicy::default()
            },
        );

        // Five ~300-byte entries written in sequence; eviction must leave at
        // most 3 entries and at most 800 tracked bytes.
        let payload = "x".repeat(160);
        for i in 0..5 {
            cache.set(None, &format!("entry-{i}"), &payload, &[]);
            // Distinct mtimes so oldest-first ordering is well defined.
            thread::sleep(Duration::from_millis(15));
        }

        let stats = cache.stats();
        assert!(
            stats.entry_count <= 3,
            "expected at most 3 live entries, found {}",
            stats.entry_count
        );
        assert!(
            stats.size_bytes <= 800,
            "expected tracked size <= 800, found {}",
            stats.size_bytes
        );
        // The newest entry always survives.
        assert_eq!(
            cache.get::<String>(None, "entry-4").as_deref(),
            Some(payload.as_str())
        );
    }

    #[test]
    fn eviction_removes_oldest_entries_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache_with_policy(
            dir.path(),
            CachePolicy {
                max_bytes: 700,
                ..CachePolicy::default()
            },
        );

        let payload = "y".repeat(160);
        for i in 0..3 {
            cache.set(None, &format!("entry-{i}"), &payload, &[]);
            thread::sleep(Duration::from_millis(15));
        }

        // entry-0 is the oldest on disk; it must be the one evicted. Its
        // memory mirror is pruned with it so the tiers stay consistent.
        assert_eq!(cache.get::<String>(None, "entry-0"), None);
        assert!(cache.get::<String>(None, "entry-2").is_some());
    }

    #[test]
    fn disk_write_failure_still_serves_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let cache = make_cache(&cache_dir);

        // Replace the cache directory with a plain file so disk writes fail.
        fs::remove_dir_all(&cache_dir).unwrap();
        fs::write(&cache_dir, b"not a directory").unwrap();

        cache.set(None, "k", &"still here".to_string(), &[]);
        assert_eq!(
            cache.get::<String>(None, "k").as_deref(),
            Some("still here")
        );
    }

    #[test]
    fn disabled_by_configuration_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.enabled = false;
        let cache = BuildCache::new(config);

        cache.set(None, "k", &1_u32, &[]);
        assert_eq!(cache.get::<u32>(None, "k"), None);
        cache.invalidate(None, "k");
        cache.clear_prefix("asset");
        cache.clear();
        cache.sweep();

        let stats = cache.stats();
        assert!(!stats.enabled);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.directory, None);
    }

    #[test]
    fn unusable_directory_disables_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        fs::write(&blocker, b"file, not a directory").unwrap();

        let cache = BuildCache::new(CacheConfig::new(&blocker));
        assert!(!cache.is_enabled());
        cache.set(None, "k", &1_u32, &[]);
        assert_eq!(cache.get::<u32>(None, "k"), None);
    }

    #[test]
    fn invalidate_removes_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.set(None, "k", &1_u32, &[]);
        cache.invalidate(None, "k");

        assert_eq!(cache.get::<u32>(None, "k"), None);
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn clear_prefix_only_touches_that_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.set(Some("asset"), "a", &1_u32, &[]);
        cache.set(Some("asset"), "b", &2_u32, &[]);
        cache.set(Some("transform"), "a", &3_u32, &[]);

        cache.clear_prefix("asset");

        assert_eq!(cache.get::<u32>(Some("asset"), "a"), None);
        assert_eq!(cache.get::<u32>(Some("asset"), "b"), None);
        assert_eq!(cache.get::<u32>(Some("transform"), "a"), Some(3));
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.set(None, "a", &1_u32, &[]);
        cache.set(Some("asset"), "b", &2_u32, &[]);
        cache.clear();

        assert_eq!(cache.get::<u32>(None, "a"), None);
        assert_eq!(cache.get::<u32>(Some("asset"), "b"), None);
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.size_bytes, 0);
    }

    #[test]
    fn disk_entries_survive_into_a_new_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = make_cache(dir.path());
            cache.set(None, "k", &"persisted".to_string(), &[]);
        }

        // A fresh store has an empty memory tier; the hit comes from disk and
        // repopulates memory.
        let cache = make_cache(dir.path());
        assert_eq!(
            cache.get::<String>(None, "k").as_deref(),
            Some("persisted")
        );
        assert_eq!(
            cache.get::<String>(None, "k").as_deref(),
            Some("persisted")
        );
    }

    #[test]
    fn tracked_bytes_recomputed_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let expected = {
            let cache = make_cache(dir.path());
            cache.set(None, "a", &"one".to_string(), &[]);
            cache.set(None, "b", &"two".to_string(), &[]);
            cache.stats().size_bytes
        };
        assert!(expected > 0);

        let cache = make_cache(dir.path());
        assert_eq!(cache.stats().size_bytes, expected);
        assert_eq!(cache.stats().entry_count, 2);
    }

    #[test]
    fn foreign_version_entries_are_deleted_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());
        cache.set(None, "k", &1_u32, &[]);

        // Rewrite the entry as if an older Kiln had produced it.
        let name = entry_name(None, "k");
        let path = dir.path().join(format!("{name}.{ENTRY_EXT}"));
        let mut doc: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        doc["kiln_version"] = serde_json::Value::String("0.0.0-old".to_string());
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        // Memory still holds the fresh copy; a new store must reject the file.
        let fresh = make_cache(dir.path());
        assert_eq!(fresh.get::<u32>(None, "k"), None);
        assert!(!path.exists());
    }

    #[test]
    fn startup_sweep_drops_corrupt_entries_and_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = make_cache(dir.path());
            cache.set(None, "good", &1_u32, &[]);
        }
        fs::write(dir.path().join("garbage.json"), b"not json at all").unwrap();
        fs::write(dir.path().join("entry.json.tmp.123.0"), b"leftover").unwrap();

        let cache = make_cache(dir.path());
        assert_eq!(cache.stats().entry_count, 1);
        assert!(!dir.path().join("garbage.json").exists());
        assert!(!dir.path().join("entry.json.tmp.123.0").exists());
        assert_eq!(cache.get::<u32>(None, "good"), Some(1));
    }

    #[test]
    fn startup_sweep_drops_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = make_cache_with_policy(
                dir.path(),
                CachePolicy {
                    ttl_millis: 10,
                    ..CachePolicy::default()
                },
            );
            cache.set(None, "short-lived", &1_u32, &[]);
        }
        thread::sleep(Duration::from_millis(40));

        let cache = make_cache_with_policy(
            dir.path(),
            CachePolicy {
                ttl_millis: 10,
                ..CachePolicy::default()
            },
        );
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.get::<u32>(None, "short-lived"), None);
    }

    #[test]
    fn serialized_key_is_stable_for_equal_values() {
        #[derive(serde::Serialize)]
        struct TransformOptions {
            minify: bool,
            target: &'static str,
        }

        let a = serialized_key(&TransformOptions {
            minify: true,
            target: "es2020",
        })
        .unwrap();
        let b = serialized_key(&TransformOptions {
            minify: true,
            target: "es2020",
        })
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stats_reports_directory_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(dir.path());
        cache.set(None, "k", &"value".to_string(), &[]);

        let stats = cache.stats();
        assert!(stats.enabled);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.size_bytes > 0);
        assert_eq!(stats.directory.as_deref(), Some(dir.path()));
    }
}
