//! Key-value storage contract and backends.
//!
//! The tracker only needs `put`/`get`/`delete`/`list`. Snapshots, the sync
//! backlog and session-id bookkeeping all go through this trait, so the
//! concrete store can be swapped per platform.
//!
//! Every backend replaces values atomically: a concurrent reader sees either
//! the previous value or the new one, never a partial write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::error::{Result, TrackerError};

/// Durable byte storage keyed by string.
pub trait KeyValueStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous value.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the value under `key`, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store, used in tests and when durability is not needed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, key: &str) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| TrackerError::storage(key, "Failed to acquire store lock"))
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.lock(key)?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock(key)?.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock(key)?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .lock(prefix)?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// File system
// ============================================================================

const TEMP_PREFIX: &str = ".tmp-";

/// One file per key under a directory.
///
/// Writes go to a uniquely named temporary file in the same directory which
/// is then renamed over the target, so readers in another process never
/// observe a half-written snapshot.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| TrackerError::storage(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(checked_key(key)?))
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Keys are used verbatim as file names, so only `[A-Za-z0-9._-]` is
/// allowed and a key may not start with `.`. Distinct keys can never share
/// a file, and `list` returns exactly what was stored.
fn checked_key(key: &str) -> Result<&str> {
    if key.is_empty() || key.starts_with('.') || !key.chars().all(is_key_char) {
        return Err(TrackerError::storage(key, "Unsupported characters in key"));
    }
    Ok(key)
}

impl KeyValueStore for FileStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path_for(key)?;
        let temp = self.root.join(format!(
            "{}{}-{}",
            TEMP_PREFIX,
            key,
            uuid::Uuid::new_v4().simple()
        ));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&temp);
            TrackerError::storage(key, e)
        })?;
        debug!("[FileStore] Wrote {} bytes to {}", bytes.len(), target.display());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrackerError::storage(key, e)),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TrackerError::storage(key, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !prefix.chars().all(is_key_char) {
            return Err(TrackerError::storage(prefix, "Unsupported characters in key prefix"));
        }
        let entries = fs::read_dir(&self.root).map_err(|e| TrackerError::storage(prefix, e))?;
        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with(TEMP_PREFIX) && name.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Single-table SQLite store.
#[cfg(feature = "persistence")]
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

#[cfg(feature = "persistence")]
impl SqliteStore {
    /// Open a store at `db_path`, creating the table if needed.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path).map_err(|e| TrackerError::storage(db_path, e))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .map_err(|e| TrackerError::storage(db_path, e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn with_conn<T>(
        &self,
        key: &str,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| TrackerError::storage(key, "Failed to acquire connection lock"))?;
        f(&conn).map_err(|e| TrackerError::storage(key, e))
    }
}

#[cfg(feature = "persistence")]
impl KeyValueStore for SqliteStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        use rusqlite::params;
        self.with_conn(key, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))",
                params![key, bytes],
            )
            .map(|_| ())
        })
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        use rusqlite::{params, OptionalExtension};
        self.with_conn(key, |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        use rusqlite::params;
        self.with_conn(key, |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|_| ())
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        use rusqlite::params;
        self.with_conn(prefix, |conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(keys)
        })
    }
}
