//! SQLite backend, so stores survive restarts.

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{CacheBackend, CacheEntry, RequestKey};
use crate::{Result, ServiceWorkerError};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Stores persisted in a SQLite database.
pub struct SqliteCacheStorage {
    conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
        }

        let conn = Connection::open(path).map_err(|e| {
            ServiceWorkerError::CacheError(format!("Failed to open cache database: {}", e))
        })?;
        info!(path = %path.display(), "Opened cache database");
        Self::init(conn)
    }

    /// Database that lives as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )
            .unwrap_or(false);

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceWorkerError::CacheError("cache database lock poisoned".into()))
    }

    fn open_sync(&self, name: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
            params![name, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn has_sync(&self, name: &str) -> Result<bool> {
        let found = self
            .conn()?
            .query_row("SELECT 1 FROM caches WHERE name = ?1", params![name], |_| {
                Ok(())
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn delete_sync(&self, name: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM caches WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    fn keys_sync(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn get_sync(&self, name: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, headers, body, cached_at FROM cache_entries
                 WHERE cache_name = ?1 AND method = ?2 AND url = ?3",
                params![name, key.method, key.url],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((status, headers, body, cached_at)) => {
                let headers: Vec<(String, Vec<u8>)> = serde_json::from_str(&headers)
                    .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
                Ok(Some(CacheEntry {
                    url: key.url.clone(),
                    method: key.method.clone(),
                    status,
                    headers,
                    body,
                    cached_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn put_sync(&self, name: &str, entry: &CacheEntry) -> Result<()> {
        let headers = serde_json::to_string(&entry.headers)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
            params![name, entry.cached_at],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO cache_entries
             (cache_name, method, url, status, headers, body, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                entry.method,
                entry.url,
                entry.status,
                headers,
                entry.body,
                entry.cached_at
            ],
        )?;
        tx.commit()?;
        debug!(cache = name, url = %entry.url, "Stored entry");
        Ok(())
    }

    fn remove_sync(&self, name: &str, key: &RequestKey) -> Result<bool> {
        let removed = self.conn()?.execute(
            "DELETE FROM cache_entries WHERE cache_name = ?1 AND method = ?2 AND url = ?3",
            params![name, key.method, key.url],
        )?;
        Ok(removed > 0)
    }

    fn entry_keys_sync(&self, name: &str) -> Result<Vec<RequestKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT method, url FROM cache_entries WHERE cache_name = ?1 ORDER BY method, url",
        )?;
        let keys = stmt
            .query_map(params![name], |row| {
                Ok(RequestKey {
                    method: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_name TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_name, method, url)
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, chrono::Utc::now().timestamp()],
    )?;

    Ok(())
}

impl CacheBackend for SqliteCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.open_sync(name) })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.has_sync(name) })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.delete_sync(name) })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move { self.keys_sync() })
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
        Box::pin(async move { self.get_sync(name, key) })
    }

    fn put<'a>(&'a self, name: &'a str, entry: CacheEntry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.put_sync(name, &entry) })
    }

    fn remove<'a>(&'a self, name: &'a str, key: &'a RequestKey) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.remove_sync(name, key) })
    }

    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<RequestKey>>> {
        Box::pin(async move { self.entry_keys_sync(name) })
    }
}
