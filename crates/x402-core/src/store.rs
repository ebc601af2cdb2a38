//! TTL key-value store backing nonce and idempotency records.
//!
//! The store is the only inter-request synchronization point: replay safety
//! rests on `put_if_absent` being atomic. Two backends, both thread-safe:
//! an in-memory map for tests and single-process deployments, and SQLite for
//! durability across restarts.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Minimal contract the payment core needs from its persistence layer:
/// GET, SET with TTL, SET-if-absent with TTL, DEL.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically set `key` iff no live entry exists. Returns `true` iff this
    /// caller performed the write; two concurrent callers cannot both see
    /// `true`.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store backed by DashMap. Fast, lost on restart.
pub struct MemoryKvStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // Expired: sweep it so a later claim can take the key.
        self.entries.remove_if(key, |_, (_, deadline)| *deadline <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        use dashmap::mapref::entry::Entry;
        let now = Instant::now();
        // The entry API holds the shard lock, making check-then-set atomic
        // within the process.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().1 <= now => {
                occupied.insert((value.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert((value.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Persistent store backed by SQLite. Survives restarts; the INSERT primary
/// key constraint makes the claim atomic across processes sharing the file.
pub struct SqliteKvStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteKvStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            PRAGMA journal_mode=WAL;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        use rusqlite::OptionalExtension;
        let conn = self.lock()?;
        let now = unix_ms();
        conn.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at <= ?2",
            rusqlite::params![key, now],
        )?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let expires_at = unix_ms() + ttl.as_millis() as i64;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, value, expires_at],
        )?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let now = unix_ms();
        // Expired rows are swept first so the INSERT's primary key constraint
        // decides the race among live claimants only. Both statements run
        // under the same connection lock.
        conn.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at <= ?2",
            rusqlite::params![key, now],
        )?;
        let inserted = conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, value, now + ttl.as_millis() as i64],
        );
        match inserted {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
        Ok(())
    }
}
