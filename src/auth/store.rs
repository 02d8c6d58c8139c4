// Durable token storage
// Small key-value stores holding the access and refresh tokens with a TTL

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Key-value store for session tokens
///
/// Entries are process-wide: there is no per-path scoping. An entry whose TTL
/// has elapsed reads as absent.
pub trait TokenStore: Send + Sync {
    /// Read a value, `None` when missing or expired
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value that expires after `ttl`
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a value (no-op when missing)
    fn clear(&self, key: &str) -> Result<()>;
}

/// In-process token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, DateTime<Utc>)>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("Token store lock poisoned"))
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Utc::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = expiry_after(ttl)?;
        self.lock()?
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// SQLite-backed token store
///
/// Uses a single `auth_kv` table so the file survives process restarts.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create token store directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        tracing::debug!("Opened token store: {}", path.display());
        Self::with_connection(conn)
    }

    /// Store that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Token store lock poisoned"))
    }
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT value, expires_at FROM auth_kv WHERE key = ?",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("Failed to read {} from token store", key))?;

        let Some((value, expires_at)) = row else {
            return Ok(None);
        };

        // Unparseable timestamps are treated like expired entries
        let live = parse_datetime(&expires_at)
            .map(|exp| exp > Utc::now())
            .unwrap_or(false);
        if live {
            return Ok(Some(value));
        }

        tracing::debug!("Purging expired token store entry: {}", key);
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [key])
            .with_context(|| format!("Failed to purge {} from token store", key))?;
        Ok(None)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = expiry_after(ttl)?.to_rfc3339();
        self.lock()?
            .execute(
                "INSERT INTO auth_kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )
            .with_context(|| format!("Failed to write {} to token store", key))?;
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.lock()?
            .execute("DELETE FROM auth_kv WHERE key = ?", [key])
            .with_context(|| format!("Failed to clear {} from token store", key))?;
        Ok(())
    }
}

/// Expiry timestamp `ttl` from now
fn expiry_after(ttl: Duration) -> Result<DateTime<Utc>> {
    Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| anyhow!("Token TTL out of range: {} days", ttl.num_days()))
}

/// Parse an RFC 3339 timestamp as written by `set`
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &dyn TokenStore) {
        assert_eq!(store.get("accessToken").unwrap(), None);

        store.set("accessToken", "T1", Duration::days(30)).unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("T1"));

        // Overwrite keeps a single entry
        store.set("accessToken", "T2", Duration::days(30)).unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("T2"));

        store.clear("accessToken").unwrap();
        assert_eq!(store.get("accessToken").unwrap(), None);

        // Clearing a missing key is fine
        store.clear("accessToken").unwrap();
    }

    #[test]
    fn test_memory_store_roundtrip() {
        exercise_store(&MemoryTokenStore::new());
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        exercise_store(&SqliteTokenStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_memory_store_expired_entry_reads_absent() {
        let store = MemoryTokenStore::new();
        store.set("refreshToken", "R1", Duration::seconds(-1)).unwrap();
        assert_eq!(store.get("refreshToken").unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_expired_entry_is_purged() {
        let store = SqliteTokenStore::open_in_memory().unwrap();
        store.set("refreshToken", "R1", Duration::seconds(-1)).unwrap();
        assert_eq!(store.get("refreshToken").unwrap(), None);

        let count: i64 = store
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM auth_kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_sqlite_store_keys_are_independent() {
        let store = SqliteTokenStore::open_in_memory().unwrap();
        store.set("accessToken", "T1", Duration::days(1)).unwrap();
        store.set("refreshToken", "R1", Duration::days(1)).unwrap();
        store.clear("accessToken").unwrap();
        assert_eq!(store.get("accessToken").unwrap(), None);
        assert_eq!(store.get("refreshToken").unwrap().as_deref(), Some("R1"));
    }

    #[test]
    fn test_out_of_range_ttl_is_an_error() {
        let ttl = Duration::MAX;

        let memory = MemoryTokenStore::new();
        assert!(memory.set("accessToken", "T1", ttl).is_err());
        assert_eq!(memory.get("accessToken").unwrap(), None);

        let sqlite = SqliteTokenStore::open_in_memory().unwrap();
        let err = sqlite.set("accessToken", "T1", ttl).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(sqlite.get("accessToken").unwrap(), None);
    }

    #[test]
    fn test_parse_datetime() {
        // Test with Z suffix
        let dt = parse_datetime("2025-01-12T10:30:00Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-12T10:30:00+00:00");

        // Test with timezone
        let dt = parse_datetime("2025-01-12T10:30:00+00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-12T10:30:00+00:00");

        assert!(parse_datetime("yesterday").is_err());
    }
}
