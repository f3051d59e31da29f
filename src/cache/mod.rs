//! Cache Store (B): persists `TestResult`s keyed by URI, with age-based
//! pruning and a single-writer-at-a-time save path.
//!
//! Grounded on `CacheMixin`'s load/save routines: tolerant load
//! (a missing file, invalid JSON, wrong shape, or wrong version all degrade
//! to an empty cache rather than raising), and a save path that builds the
//! full payload in memory before writing it out in one shot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::clock::Clock;
use crate::core::model::{CACHE_VERSION, CacheEntry};

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    generated_at: String,
    entries: Vec<CacheEntry>,
}

pub struct CacheStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Populates the in-memory map from disk. Never fails: anything that
    /// doesn't parse cleanly just leaves the cache empty.
    pub fn load(&self) {
        let map = Self::read_file(&self.path).unwrap_or_default();
        *self.entries.lock() = map;
    }

    fn read_file(path: &Path) -> Option<HashMap<String, CacheEntry>> {
        let raw = std::fs::read_to_string(path).ok()?;
        let file: CacheFile = match serde_json::from_str(&raw) {
            Ok(f) => f,
            Err(err) => {
                warn!("cache file at {} is not valid JSON: {err}", path.display());
                return None;
            }
        };
        if file.version != CACHE_VERSION {
            warn!(
                "cache file at {} has version {} (expected {CACHE_VERSION}); ignoring",
                path.display(),
                file.version
            );
            return None;
        }
        Some(
            file.entries
                .into_iter()
                .filter(|e| !e.uri.trim().is_empty())
                .map(|e| (e.uri.clone(), e))
                .collect(),
        )
    }

    pub fn lookup(&self, uri: &str) -> Option<CacheEntry> {
        self.entries.lock().get(uri).cloned()
    }

    /// Replaces any existing entry for the same URI.
    pub fn merge(&self, entry: CacheEntry) {
        self.entries.lock().insert(entry.uri.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes entries with `tested_at_ts < now - age`. `age = None` means
    /// "everything" (the empty age expression). Returns the number pruned.
    pub fn prune(&self, age: Option<f64>) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        match age {
            None => entries.clear(),
            Some(age_secs) => entries.retain(|_, e| e.tested_at_ts >= now - age_secs),
        }
        before - entries.len()
    }

    /// Rewrites the full file: builds the payload in memory first, then
    /// performs a single write. `&self` only needs shared access because
    /// the lock below is the single-writer guarantee.
    pub fn save(&self) -> std::io::Result<()> {
        let mut entries = self.entries.lock();
        let mut list: Vec<CacheEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| a.uri.cmp(&b.uri));

        let payload = CacheFile {
            version: CACHE_VERSION,
            generated_at: format_timestamp(self.clock.now()),
            entries: list,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&payload)?;
        std::fs::write(&self.path, json)?;

        // in-memory map mirrors the file exactly after a successful save
        *entries = payload
            .entries
            .into_iter()
            .map(|e| (e.uri.clone(), e))
            .collect();
        Ok(())
    }
}

fn format_timestamp(epoch_secs: f64) -> String {
    let millis = (epoch_secs * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses age expressions like `5H`, `1D`, `2W`, or comma-joined combinations
/// summed together (`1D,12H`). An empty expression means "everything" and
/// is represented as `None`.
pub fn parse_age_expr(expr: &str) -> Result<Option<f64>, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(None);
    }

    let mut total = 0.0;
    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (value, unit) = part.split_at(part.len() - 1);
        let value: f64 = value
            .parse()
            .map_err(|_| format!("invalid age expression: {part}"))?;
        let unit_secs = match unit.to_ascii_uppercase().as_str() {
            "H" => 3600.0,
            "D" => 86_400.0,
            "W" => 604_800.0,
            other => return Err(format!("unknown age unit: {other}")),
        };
        total += value * unit_secs;
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FakeClock;
    use crate::core::model::{Geo, Status};
    use tempfile::tempdir;

    fn entry(uri: &str, tested_at_ts: f64) -> CacheEntry {
        CacheEntry {
            uri: uri.to_string(),
            status: Status::Ok,
            ping: Some(42.0),
            tested_at_ts,
            server_geo: Some(Geo::new("1.2.3.4")),
            exit_geo: None,
        }
    }

    #[test]
    fn load_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("nope.json"), Arc::new(FakeClock::new(1000.0)));
        store.load();
        assert!(store.is_empty());
    }

    #[test]
    fn load_tolerates_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = CacheStore::new(path, Arc::new(FakeClock::new(1000.0)));
        store.load();
        assert!(store.is_empty());
    }

    #[test]
    fn load_tolerates_wrong_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"version":999,"generated_at":"x","entries":[]}"#).unwrap();
        let store = CacheStore::new(path, Arc::new(FakeClock::new(1000.0)));
        store.load();
        assert!(store.is_empty());
    }

    #[test]
    fn save_then_load_round_trips_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/cache.json");
        let store = CacheStore::new(&path, Arc::new(FakeClock::new(1000.0)));
        store.merge(entry("ss://a", 900.0));
        store.save().unwrap();

        let reloaded = CacheStore::new(&path, Arc::new(FakeClock::new(1000.0)));
        reloaded.load();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.lookup("ss://a").unwrap().ping, Some(42.0));
    }

    #[test]
    fn save_directory_is_created_if_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c/cache.json");
        let store = CacheStore::new(&path, Arc::new(FakeClock::new(1000.0)));
        store.merge(entry("ss://a", 900.0));
        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn in_memory_map_mirrors_file_after_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = CacheStore::new(&path, Arc::new(FakeClock::new(1000.0)));
        store.merge(entry("ss://a", 900.0));
        store.merge(entry("ss://b", 950.0));
        store.save().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn merge_replaces_existing_entry_for_same_uri() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("c.json"), Arc::new(FakeClock::new(1000.0)));
        store.merge(entry("ss://a", 900.0));
        store.merge(entry("ss://a", 950.0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("ss://a").unwrap().tested_at_ts, 950.0);
    }

    #[test]
    fn prune_removes_entries_older_than_age() {
        let clock = Arc::new(FakeClock::new(10_000.0));
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("c.json"), clock.clone());
        store.merge(entry("ss://old", 1_000.0));
        store.merge(entry("ss://new", 9_999.0));

        let removed = store.prune(Some(3600.0));
        assert_eq!(removed, 1);
        assert!(store.lookup("ss://old").is_none());
        assert!(store.lookup("ss://new").is_some());
    }

    #[test]
    fn zero_age_prune_removes_nothing() {
        let clock = Arc::new(FakeClock::new(10_000.0));
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("c.json"), clock);
        store.merge(entry("ss://a", 10_000.0));
        let removed = store.prune(Some(0.0));
        assert_eq!(removed, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_age_expression_prunes_everything() {
        let clock = Arc::new(FakeClock::new(10_000.0));
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("c.json"), clock);
        store.merge(entry("ss://a", 10_000.0));
        let removed = store.prune(None);
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn parse_age_expr_sums_comma_joined_units() {
        let secs = parse_age_expr("1D,12H").unwrap().unwrap();
        assert_eq!(secs, 86_400.0 + 12.0 * 3600.0);
    }

    #[test]
    fn parse_age_expr_empty_string_means_everything() {
        assert_eq!(parse_age_expr("").unwrap(), None);
        assert_eq!(parse_age_expr("   ").unwrap(), None);
    }

    #[test]
    fn parse_age_expr_rejects_unknown_unit() {
        assert!(parse_age_expr("5X").is_err());
    }
}
