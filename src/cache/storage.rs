//! Cache storage trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::net::{Response, ResponseKind};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
  /// The captured response
  pub response: Response,
  /// When the record was written
  pub cached_at: DateTime<Utc>,
  /// Hex SHA-256 of the body, taken at write time
  pub digest: String,
}

/// Name-partitioned persistent key-value store for responses.
///
/// Each named store holds records keyed by request locator. Writing a locator
/// that already exists replaces the previous record.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named store if it does not exist yet.
  fn open_store(&self, store: &str) -> Result<()>;

  /// Whether the named store exists.
  fn has_store(&self, store: &str) -> Result<bool>;

  /// Names of all stores, sorted.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all its records. Returns false if it did not exist.
  fn delete_store(&self, store: &str) -> Result<bool>;

  /// Look up a record. A missing store reads as a miss.
  fn get(&self, store: &str, locator: &str) -> Result<Option<CachedRecord>>;

  /// Write one record into an existing store. Writing into a store that has
  /// been deleted is an error, so a late write cannot resurrect it.
  fn put(&self, store: &str, locator: &str, response: &Response) -> Result<()>;

  /// Write several records atomically, creating the store if needed. Either
  /// all records land or none do.
  fn put_all(&self, store: &str, records: &[(String, Response)]) -> Result<()>;

  /// Delete one record. Returns false if it did not exist.
  fn delete(&self, store: &str, locator: &str) -> Result<bool>;

  /// Locators held by a store, sorted.
  fn locators(&self, store: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("precache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named store (cache generation)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses keyed by request locator
CREATE TABLE IF NOT EXISTS cache_records (
    store_name TEXT NOT NULL,
    locator TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, locator),
    FOREIGN KEY (store_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);
"#;

fn insert_record(
  conn: &Connection,
  store: &str,
  locator: &str,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_records (store_name, locator, status, kind, headers, body, body_sha256, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        locator,
        response.status,
        response.kind.as_str(),
        headers,
        response.body,
        response.digest()
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", locator, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
        params![store],
      )
      .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    Ok(())
  }

  fn has_store(&self, store: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query store {}: {}", store, e))?;

    Ok(found.is_some())
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_records WHERE store_name = ?",
      params![store],
    )
    .map_err(|e| eyre!("Failed to delete records of {}: {}", store, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete store {}: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, store: &str, locator: &str) -> Result<Option<CachedRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, kind, headers, body, body_sha256, cached_at FROM cache_records
         WHERE store_name = ? AND locator = ?",
        params![store, locator],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", locator, e))?;

    let Some((status, kind, headers, body, digest, cached_at)) = row else {
      return Ok(None);
    };

    let kind: ResponseKind = kind.parse().map_err(|e: String| eyre!(e))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", locator, e))?;

    Ok(Some(CachedRecord {
      response: Response {
        status,
        kind,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
      digest,
    }))
  }

  fn put(&self, store: &str, locator: &str, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let exists: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query store {}: {}", store, e))?;

    if exists.is_none() {
      return Err(eyre!("Store {} does not exist", store));
    }

    insert_record(&conn, store, locator, response)
  }

  fn put_all(&self, store: &str, records: &[(String, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![store],
    )
    .map_err(|e| eyre!("Failed to open store {}: {}", store, e))?;

    for (locator, response) in records {
      insert_record(&tx, store, locator, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, store: &str, locator: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM cache_records WHERE store_name = ? AND locator = ?",
        params![store, locator],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", locator, e))?;

    Ok(removed > 0)
  }

  fn locators(&self, store: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT locator FROM cache_records WHERE store_name = ? ORDER BY locator")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let locators = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list records of {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read locator: {}", e))?;

    Ok(locators)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

type Stores = BTreeMap<String, BTreeMap<String, CachedRecord>>;

/// Storage that lives only as long as the process.
///
/// Counts reads and writes so callers can observe store traffic.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Stores>,
  reads: AtomicUsize,
  writes: AtomicUsize,
  undeletable: Mutex<BTreeSet<String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of record lookups served so far.
  #[cfg(test)]
  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  /// Number of record writes so far (each record of a `put_all` counts).
  #[cfg(test)]
  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  /// Make `delete_store` fail for the named store.
  #[cfg(test)]
  pub fn refuse_delete(&self, store: &str) {
    self
      .undeletable
      .lock()
      .unwrap()
      .insert(store.to_string());
  }

  fn stores(&self) -> Result<std::sync::MutexGuard<'_, Stores>> {
    self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    self.stores()?.entry(store.to_string()).or_default();
    Ok(())
  }

  fn has_store(&self, store: &str) -> Result<bool> {
    Ok(self.stores()?.contains_key(store))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    Ok(self.stores()?.keys().cloned().collect())
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let refused = self
      .undeletable
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .contains(store);
    if refused {
      return Err(eyre!("Store {} is locked", store));
    }

    Ok(self.stores()?.remove(store).is_some())
  }

  fn get(&self, store: &str, locator: &str) -> Result<Option<CachedRecord>> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .stores()?
        .get(store)
        .and_then(|records| records.get(locator))
        .cloned(),
    )
  }

  fn put(&self, store: &str, locator: &str, response: &Response) -> Result<()> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    let mut stores = self.stores()?;
    let records = stores
      .get_mut(store)
      .ok_or_else(|| eyre!("Store {} does not exist", store))?;

    records.insert(
      locator.to_string(),
      CachedRecord {
        response: response.clone(),
        cached_at: Utc::now(),
        digest: response.digest(),
      },
    );
    Ok(())
  }

  fn put_all(&self, store: &str, records: &[(String, Response)]) -> Result<()> {
    let mut stores = self.stores()?;
    let entries = stores.entry(store.to_string()).or_default();
    let now = Utc::now();

    for (locator, response) in records {
      self.writes.fetch_add(1, Ordering::SeqCst);
      entries.insert(
        locator.clone(),
        CachedRecord {
          response: response.clone(),
          cached_at: now,
          digest: response.digest(),
        },
      );
    }
    Ok(())
  }

  fn delete(&self, store: &str, locator: &str) -> Result<bool> {
    Ok(
      self
        .stores()?
        .get_mut(store)
        .map(|records| records.remove(locator).is_some())
        .unwrap_or(false),
    )
  }

  fn locators(&self, store: &str) -> Result<Vec<String>> {
    Ok(
      self
        .stores()?
        .get(store)
        .map(|records| records.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(body: &str) -> Response {
    Response::new(200, ResponseKind::Basic, body).with_header("content-type", "text/html")
  }

  fn sqlite() -> (tempfile::TempDir, SqliteStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(&dir.path().join("nested").join("cache.db")).unwrap();
    (dir, storage)
  }

  #[test]
  fn test_sqlite_put_get_roundtrip() {
    let (_dir, storage) = sqlite();
    storage.open_store("app-cache-v1").unwrap();

    storage
      .put("app-cache-v1", "https://app.example.com/", &response("<html>"))
      .unwrap();

    let record = storage
      .get("app-cache-v1", "https://app.example.com/")
      .unwrap()
      .expect("record should exist");
    assert_eq!(record.response, response("<html>"));
    assert_eq!(record.digest, response("<html>").digest());
    assert!(storage.has_store("app-cache-v1").unwrap());
  }

  #[test]
  fn test_record_digest_matches_body() {
    let (_dir, sqlite) = sqlite();
    let memory = MemoryStorage::new();
    let records = vec![
      ("https://app.example.com/".to_string(), response("root")),
      ("https://app.example.com/logo.png".to_string(), response("png")),
    ];

    for storage in [&sqlite as &dyn CacheStorage, &memory] {
      storage.put_all("v1", &records).unwrap();
      for (locator, stored) in &records {
        let record = storage.get("v1", locator).unwrap().unwrap();
        assert_eq!(record.digest, stored.digest());
        assert_eq!(record.digest.len(), 64);
      }
    }
  }

  #[test]
  fn test_sqlite_put_overwrites() {
    let (_dir, storage) = sqlite();
    storage.open_store("v1").unwrap();

    storage.put("v1", "https://a/", &response("old")).unwrap();
    storage.put("v1", "https://a/", &response("new")).unwrap();

    let record = storage.get("v1", "https://a/").unwrap().unwrap();
    assert_eq!(record.response.body, b"new".to_vec());
    assert_eq!(storage.locators("v1").unwrap(), vec!["https://a/".to_string()]);
  }

  #[test]
  fn test_sqlite_stores_are_partitioned() {
    let (_dir, storage) = sqlite();

    storage.open_store("v1").unwrap();
    storage.open_store("v2").unwrap();
    storage.put("v1", "https://a/", &response("one")).unwrap();

    assert!(storage.get("v2", "https://a/").unwrap().is_none());
    assert_eq!(
      storage.store_names().unwrap(),
      vec!["v1".to_string(), "v2".to_string()]
    );
  }

  #[test]
  fn test_sqlite_delete_store_removes_records() {
    let (_dir, storage) = sqlite();

    storage.open_store("v1").unwrap();
    storage.put("v1", "https://a/", &response("one")).unwrap();
    assert!(storage.delete_store("v1").unwrap());
    assert!(!storage.delete_store("v1").unwrap());

    assert!(!storage.has_store("v1").unwrap());
    assert!(storage.get("v1", "https://a/").unwrap().is_none());
    assert!(storage.locators("v1").unwrap().is_empty());

    // Recreating the store starts empty
    storage.open_store("v1").unwrap();
    assert!(storage.locators("v1").unwrap().is_empty());
  }

  #[test]
  fn test_sqlite_put_all_and_delete() {
    let (_dir, storage) = sqlite();

    let records = vec![
      ("https://a/".to_string(), response("a")),
      ("https://b/".to_string(), Response::opaque("b")),
    ];
    storage.put_all("v1", &records).unwrap();

    assert_eq!(storage.locators("v1").unwrap().len(), 2);
    let opaque = storage.get("v1", "https://b/").unwrap().unwrap();
    assert_eq!(opaque.response.kind, ResponseKind::Opaque);
    assert_eq!(opaque.response.status, 0);

    assert!(storage.delete("v1", "https://a/").unwrap());
    assert!(!storage.delete("v1", "https://a/").unwrap());
    assert_eq!(storage.locators("v1").unwrap(), vec!["https://b/".to_string()]);
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.open_store("v1").unwrap();
      storage.put("v1", "https://a/", &response("kept")).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let record = storage.get("v1", "https://a/").unwrap().unwrap();
    assert_eq!(record.response.body, b"kept".to_vec());
  }

  #[test]
  fn test_memory_counts_traffic() {
    let storage = MemoryStorage::new();
    storage.open_store("v1").unwrap();

    storage.put("v1", "https://a/", &response("a")).unwrap();
    assert!(storage.get("v1", "https://a/").unwrap().is_some());
    assert!(storage.get("v2", "https://a/").unwrap().is_none());

    assert_eq!(storage.writes(), 1);
    assert_eq!(storage.reads(), 2);
  }

  #[test]
  fn test_put_does_not_resurrect_deleted_store() {
    let (_dir, sqlite) = sqlite();
    let memory = MemoryStorage::new();
    let stores: [&dyn CacheStorage; 2] = [&sqlite, &memory];

    for storage in stores {
      storage.open_store("v1").unwrap();
      storage.delete_store("v1").unwrap();

      assert!(storage.put("v1", "https://a/", &response("late")).is_err());
      assert!(!storage.has_store("v1").unwrap());
    }
  }

  #[test]
  fn test_memory_refused_delete() {
    let storage = MemoryStorage::new();
    storage.open_store("v1").unwrap();
    storage.refuse_delete("v1");

    assert!(storage.delete_store("v1").is_err());
    assert!(storage.has_store("v1").unwrap());
  }
}
