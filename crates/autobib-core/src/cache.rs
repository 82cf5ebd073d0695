//! Two-tier store for resolution results.
//!
//! **L1** – [`DashMap`] in-memory map.
//! **L2** – Optional SQLite database on disk (persists across runs).
//!
//! [`get`](ResolutionCache::get) checks L1 first and promotes L2 hits back
//! into L1; [`set`](ResolutionCache::set) writes through to both tiers.
//! Values are JSON. Nothing is ever evicted automatically: entries go away
//! only through [`delete`](ResolutionCache::delete) or a clear.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CoreError;

/// Named tables in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTable {
    /// Target source record → series ark.
    Ark,
    /// Target record → chosen match.
    Match,
    /// `(ark, page)` → OCR geometry.
    OcrBounds,
}

impl CacheTable {
    pub const ALL: [CacheTable; 3] = [CacheTable::Ark, CacheTable::Match, CacheTable::OcrBounds];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTable::Ark => "ark",
            CacheTable::Match => "match",
            CacheTable::OcrBounds => "ocr_bounds",
        }
    }
}

impl FromStr for CacheTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheTable::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::Cache(format!("unknown cache table {s:?}")))
    }
}

impl std::fmt::Display for CacheTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable cache key for any serializable value.
pub fn key_for<T: Serialize>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(|e| CoreError::Cache(e.to_string()))
}

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         CREATE TABLE IF NOT EXISTS entries (
             tbl         TEXT NOT NULL,
             key         TEXT NOT NULL,
             value       TEXT NOT NULL,
             inserted_at INTEGER NOT NULL,
             PRIMARY KEY (tbl, key)
         );",
    )?;
    Ok(conn)
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn sql_err(e: rusqlite::Error) -> CoreError {
    CoreError::Cache(e.to_string())
}

pub struct ResolutionCache {
    entries: DashMap<(CacheTable, String), String>,
    sqlite: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResolutionCache {
    /// A cache with no disk persistence.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            sqlite: None,
            path: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache backed by a SQLite database at `path`,
    /// creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_sqlite(path).map_err(|e| {
            CoreError::Cache(format!("failed to open cache database at {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "opened cache");
        Ok(Self {
            sqlite: Some(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            ..Self::in_memory()
        })
    }

    pub fn get_raw(&self, table: CacheTable, key: &str) -> Option<String> {
        let l1_key = (table, key.to_string());
        if let Some(value) = self.entries.get(&l1_key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%table, "cache L1 hit");
            return Some(value.clone());
        }

        if let Some(sqlite) = &self.sqlite
            && let Ok(conn) = sqlite.lock()
        {
            let found: Option<String> = conn
                .query_row(
                    "SELECT value FROM entries WHERE tbl = ?1 AND key = ?2",
                    params![table.as_str(), key],
                    |row| row.get(0),
                )
                .optional()
                .unwrap_or_else(|e| {
                    tracing::warn!(%table, error = %e, "cache read failed");
                    None
                });
            if let Some(value) = found {
                tracing::trace!(%table, "cache L2 hit, promoting to L1");
                self.entries.insert(l1_key, value.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set_raw(&self, table: CacheTable, key: &str, value: String) -> Result<(), CoreError> {
        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite
                .lock()
                .map_err(|_| CoreError::Cache("cache writer poisoned".into()))?;
            conn.execute(
                "INSERT OR REPLACE INTO entries (tbl, key, value, inserted_at) VALUES (?1, ?2, ?3, ?4)",
                params![table.as_str(), key, value, now_epoch() as i64],
            )
            .map_err(sql_err)?;
        }
        self.entries.insert((table, key.to_string()), value);
        Ok(())
    }

    /// Typed lookup. An entry that no longer deserializes counts as a miss.
    pub fn get<T: DeserializeOwned>(&self, table: CacheTable, key: &str) -> Option<T> {
        let raw = self.get_raw(table, key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%table, error = %e, "ignoring undecodable cache entry");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, table: CacheTable, key: &str, value: &T) -> Result<(), CoreError> {
        let raw = serde_json::to_string(value).map_err(|e| CoreError::Cache(e.to_string()))?;
        self.set_raw(table, key, raw)
    }

    pub fn delete(&self, table: CacheTable, key: &str) -> Result<(), CoreError> {
        self.entries.remove(&(table, key.to_string()));
        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite
                .lock()
                .map_err(|_| CoreError::Cache("cache writer poisoned".into()))?;
            conn.execute(
                "DELETE FROM entries WHERE tbl = ?1 AND key = ?2",
                params![table.as_str(), key],
            )
            .map_err(sql_err)?;
        }
        Ok(())
    }

    /// Empty one table in both tiers. Returns the number of L2 rows removed.
    pub fn clear_table(&self, table: CacheTable) -> Result<usize, CoreError> {
        self.entries.retain(|(t, _), _| *t != table);
        match &self.sqlite {
            Some(sqlite) => {
                let conn = sqlite
                    .lock()
                    .map_err(|_| CoreError::Cache("cache writer poisoned".into()))?;
                conn.execute("DELETE FROM entries WHERE tbl = ?1", params![table.as_str()])
                    .map_err(sql_err)
            }
            None => Ok(0),
        }
    }

    /// Remove all entries from both L1 and L2.
    pub fn clear(&self) -> Result<(), CoreError> {
        self.entries.clear();
        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite
                .lock()
                .map_err(|_| CoreError::Cache("cache writer poisoned".into()))?;
            conn.execute("DELETE FROM entries", []).map_err(sql_err)?;
            // Reclaim disk space.
            conn.execute_batch("VACUUM").map_err(sql_err)?;
        }
        Ok(())
    }

    /// Checkpoint the WAL so the database file is self-contained.
    pub fn flush(&self) -> Result<(), CoreError> {
        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite
                .lock()
                .map_err(|_| CoreError::Cache("cache writer poisoned".into()))?;
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(sql_err)?;
        }
        Ok(())
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of entries currently in L1.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total rows in the persistent store (0 if no SQLite backing).
    pub fn disk_len(&self) -> usize {
        let Some(sqlite) = &self.sqlite else {
            return 0;
        };
        sqlite
            .lock()
            .ok()
            .and_then(|conn| {
                conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get::<_, i64>(0))
                    .ok()
            })
            .unwrap_or(0) as usize
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_persistence(&self) -> bool {
        self.sqlite.is_some()
    }
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("l1_entries", &self.entries.len())
            .field("path", &self.path)
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_cache_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "autobib_test_cache_{}_{}",
            std::process::id(),
            id,
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("cache.db")
    }

    // ── L1 ─────────────────────────────────────────────────────────────

    #[test]
    fn miss_on_empty() {
        let cache = ResolutionCache::in_memory();
        assert_eq!(cache.get_raw(CacheTable::Ark, "k"), None);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn tables_are_separate() {
        let cache = ResolutionCache::in_memory();
        cache.set(CacheTable::Ark, "k", &"ark:/12148/cb1").unwrap();
        assert_eq!(cache.get::<String>(CacheTable::Ark, "k").as_deref(), Some("ark:/12148/cb1"));
        assert_eq!(cache.get::<String>(CacheTable::Match, "k"), None);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn delete_and_clear_table() {
        let cache = ResolutionCache::in_memory();
        cache.set(CacheTable::Ark, "a", &1).unwrap();
        cache.set(CacheTable::Ark, "b", &2).unwrap();
        cache.set(CacheTable::Match, "a", &3).unwrap();
        cache.delete(CacheTable::Ark, "a").unwrap();
        assert_eq!(cache.get::<i32>(CacheTable::Ark, "a"), None);
        cache.clear_table(CacheTable::Ark).unwrap();
        assert_eq!(cache.get::<i32>(CacheTable::Ark, "b"), None);
        assert_eq!(cache.get::<i32>(CacheTable::Match, "a"), Some(3));
    }

    #[test]
    fn undecodable_entry_is_a_miss() {
        let cache = ResolutionCache::in_memory();
        cache.set_raw(CacheTable::Match, "k", "not json".into()).unwrap();
        assert_eq!(cache.get::<i32>(CacheTable::Match, "k"), None);
    }

    #[test]
    fn table_names_round_trip() {
        for table in CacheTable::ALL {
            assert_eq!(table.as_str().parse::<CacheTable>().unwrap(), table);
        }
        assert!("nope".parse::<CacheTable>().is_err());
    }

    #[test]
    fn keys_are_stable() {
        let a = key_for(&("ark:/1/x", 3)).unwrap();
        let b = key_for(&("ark:/1/x", 3)).unwrap();
        assert_eq!(a, b);
    }

    // ── SQLite persistence ─────────────────────────────────────────────

    #[test]
    fn sqlite_write_and_read_after_restart() {
        let path = temp_cache_path();
        let _ = std::fs::remove_file(&path);

        let cache = ResolutionCache::open(&path).unwrap();
        cache.set(CacheTable::OcrBounds, "p1", &vec![1, 2, 3]).unwrap();
        assert_eq!(cache.disk_len(), 1);
        cache.flush().unwrap();
        drop(cache);

        let cache2 = ResolutionCache::open(&path).unwrap();
        assert!(cache2.is_empty());
        assert_eq!(cache2.get::<Vec<i32>>(CacheTable::OcrBounds, "p1"), Some(vec![1, 2, 3]));
        // Promoted to L1.
        assert_eq!(cache2.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_overwrite_and_clear() {
        let path = temp_cache_path();
        let _ = std::fs::remove_file(&path);

        let cache = ResolutionCache::open(&path).unwrap();
        cache.set(CacheTable::Ark, "k", &"old").unwrap();
        cache.set(CacheTable::Ark, "k", &"new").unwrap();
        assert_eq!(cache.disk_len(), 1);
        assert_eq!(cache.get::<String>(CacheTable::Ark, "k").as_deref(), Some("new"));
        cache.clear().unwrap();
        assert_eq!(cache.disk_len(), 0);
        assert!(cache.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_delete_reaches_disk() {
        let path = temp_cache_path();
        let _ = std::fs::remove_file(&path);

        let cache = ResolutionCache::open(&path).unwrap();
        cache.set(CacheTable::Match, "k", &1).unwrap();
        cache.delete(CacheTable::Match, "k").unwrap();
        drop(cache);
        let cache2 = ResolutionCache::open(&path).unwrap();
        assert_eq!(cache2.get::<i32>(CacheTable::Match, "k"), None);

        let _ = std::fs::remove_file(&path);
    }
}
