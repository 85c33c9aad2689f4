//! Deferred metrics cache.
//!
//! Usage events are aggregated into `(event, value) -> count` entries and kept
//! in a persisted string set until the metrics sink is known to be ready. Each
//! stored string has the form `event:value:count`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::{MetricsSink, SchedulerError};

/// Preference key holding the cached entries.
pub const CACHED_UMA_KEY: &str = "bts_cached_uma";

/// Separator between the fields of a stored entry.
const SEPARATOR: char = ':';

/// A string-keyed store of string sets that survives restarts.
pub trait PrefsStore: Send {
    /// The set stored under `key`, empty if absent.
    fn string_set(&self, key: &str) -> BTreeSet<String>;

    /// Replace the set stored under `key`.
    fn set_string_set(&mut self, key: &str, values: BTreeSet<String>)
    -> Result<(), SchedulerError>;

    /// Drop `key` entirely.
    fn remove(&mut self, key: &str) -> Result<(), SchedulerError>;
}

/// In-memory preferences. Clones share the same storage, which lets tests
/// simulate a restart by handing a clone to a fresh cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryPrefs {
    sets: Arc<Mutex<BTreeMap<String, BTreeSet<String>>>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeSet<String>>> {
        self.sets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PrefsStore for MemoryPrefs {
    fn string_set(&self, key: &str) -> BTreeSet<String> {
        self.sets().get(key).cloned().unwrap_or_default()
    }

    fn set_string_set(
        &mut self,
        key: &str,
        values: BTreeSet<String>,
    ) -> Result<(), SchedulerError> {
        self.sets().insert(key.to_string(), values);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), SchedulerError> {
        self.sets().remove(key);
        Ok(())
    }
}

/// Preferences persisted as a JSON object of `key -> [strings]`.
#[derive(Debug)]
pub struct FilePrefs {
    path: PathBuf,
    sets: BTreeMap<String, BTreeSet<String>>,
}

impl FilePrefs {
    /// Open the store at `path`, starting empty if the file doesn't exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let path = path.into();

        let sets = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, sets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `sets` to disk. The in-memory copy is only replaced once this succeeds.
    fn save(&self, sets: &BTreeMap<String, BTreeSet<String>>) -> Result<(), SchedulerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(sets)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl PrefsStore for FilePrefs {
    fn string_set(&self, key: &str) -> BTreeSet<String> {
        self.sets.get(key).cloned().unwrap_or_default()
    }

    fn set_string_set(
        &mut self,
        key: &str,
        values: BTreeSet<String>,
    ) -> Result<(), SchedulerError> {
        let mut sets = self.sets.clone();
        sets.insert(key.to_string(), values);
        self.save(&sets)?;
        self.sets = sets;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), SchedulerError> {
        if !self.sets.contains_key(key) {
            return Ok(());
        }

        let mut sets = self.sets.clone();
        sets.remove(key);
        self.save(&sets)?;
        self.sets = sets;
        Ok(())
    }
}

/// One aggregated usage event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedUmaEntry {
    pub event: String,
    pub value: i32,
    pub count: u32,
}

impl CachedUmaEntry {
    pub fn new(event: impl Into<String>, value: i32) -> Self {
        Self {
            event: event.into(),
            value,
            count: 1,
        }
    }

    /// Parse a stored `event:value:count` string.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(SEPARATOR);
        let event = parts.next()?;
        let value = parts.next()?.parse().ok()?;
        let count = parts.next()?.parse().ok()?;

        if parts.next().is_some() || event.is_empty() || count == 0 {
            return None;
        }

        Some(Self {
            event: event.to_string(),
            value,
            count,
        })
    }

    /// Format for storage.
    pub fn to_pref_string(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.event, self.value, self.count
        )
    }
}

/// Persisted multiset of `(event, value)` occurrences.
pub struct MetricsCache {
    prefs: Box<dyn PrefsStore>,
}

impl MetricsCache {
    pub fn new(prefs: impl PrefsStore + 'static) -> Self {
        Self {
            prefs: Box::new(prefs),
        }
    }

    /// All cached entries, merged by `(event, value)`. Corrupt strings are skipped.
    pub fn entries(&self) -> Vec<CachedUmaEntry> {
        let mut merged: BTreeMap<(String, i32), u32> = BTreeMap::new();

        for raw in self.prefs.string_set(CACHED_UMA_KEY) {
            match CachedUmaEntry::parse(&raw) {
                Some(entry) => {
                    let count = merged.entry((entry.event, entry.value)).or_default();
                    *count = count.saturating_add(entry.count);
                }
                None => debug!(entry = %raw, "dropping malformed cached metrics entry"),
            }
        }

        merged
            .into_iter()
            .map(|((event, value), count)| CachedUmaEntry {
                event,
                value,
                count,
            })
            .collect()
    }

    /// Record one more occurrence of `(event, value)`.
    pub fn cache_event(&mut self, event: &str, value: i32) -> Result<(), SchedulerError> {
        if event.is_empty() || event.contains(SEPARATOR) {
            warn!(event, "refusing to cache metrics event with invalid name");
            return Ok(());
        }

        let mut entries = self.entries();
        match entries
            .iter_mut()
            .find(|e| e.event == event && e.value == value)
        {
            Some(entry) => entry.count = entry.count.saturating_add(1),
            None => entries.push(CachedUmaEntry::new(event, value)),
        }

        let values = entries.iter().map(CachedUmaEntry::to_pref_string).collect();
        self.prefs.set_string_set(CACHED_UMA_KEY, values)
    }

    /// Clear the cache, then replay every occurrence it held into `sink`.
    ///
    /// Nothing is replayed if the cache cannot be cleared. Returns the number
    /// of samples replayed.
    pub fn flush_stats(&mut self, sink: &dyn MetricsSink) -> Result<u64, SchedulerError> {
        let entries = self.entries();
        self.prefs.remove(CACHED_UMA_KEY)?;

        let mut replayed = 0u64;

        for entry in &entries {
            for _ in 0..entry.count {
                sink.record_sparse(&entry.event, entry.value);
            }
            replayed += u64::from(entry.count);
        }

        info!(
            entries = entries.len(),
            samples = replayed,
            "flushed cached metrics"
        );
        Ok(replayed)
    }

    /// Drop every cached entry without replaying it.
    pub fn remove_cached_stats(&mut self) -> Result<(), SchedulerError> {
        self.prefs.remove(CACHED_UMA_KEY)
    }
}
