//! Embedded SQLite store shared by the journal, state, lock and conflict tables.
//!
//! One database file per vault. It is opened in WAL mode with a busy
//! timeout so several processes can read concurrently while writers
//! serialize, and contention degrades to waiting instead of failing.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use vaultsync_common::{DeviceId, Error, Result};

/// Current schema version stamped into `sync_meta`.
pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA_VERSION_KEY: &str = "schema_version";

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_state (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime_ms INTEGER NOT NULL,
    version INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS file_versions (
    path TEXT NOT NULL,
    version INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime_ms INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (path, version)
);

CREATE TABLE IF NOT EXISTS changes (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    old_path TEXT,
    change_type TEXT NOT NULL,
    content_hash TEXT,
    size INTEGER NOT NULL,
    mtime_ms INTEGER NOT NULL,
    detected_at INTEGER NOT NULL,
    source TEXT NOT NULL,
    device_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_detected_at ON changes(detected_at);

CREATE TABLE IF NOT EXISTS cursors (
    consumer_id TEXT PRIMARY KEY,
    last_change_id INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    path TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    local_version TEXT NOT NULL,
    remote_version TEXT NOT NULL,
    strategy TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    winner TEXT,
    loser_path TEXT,
    resolved_at INTEGER,
    resolved_by TEXT
);
"#;

/// Upgrades indexed by the version they start from: `MIGRATIONS[0]` moves a
/// version 1 database to version 2.
const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS peer_cursors (
    device_id TEXT PRIMARY KEY,
    last_change_id INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflicts_unresolved ON conflicts(resolved_at);
"#];

/// Shared handle to the vault database.
///
/// Cloning is cheap; all clones share one connection. `close()` drops the
/// connection for every clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// # Errors
    /// - Parent directory cannot be created
    /// - Database cannot be opened or migrated
    /// - Schema on disk is newer than this build understands
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Database journal mode: {}", mode);
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        let db = Self::from_connection(conn)?;
        info!("Sync database opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(Error::Closed),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            info!("Sync database closed");
        }
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| read_schema_version(conn).map(|v| v.unwrap_or(0)))
    }

    /// Get a `sync_meta` value.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM sync_meta WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Set a `sync_meta` value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Highest journal id of `device`'s own log that has been ingested here.
    pub fn get_peer_cursor(&self, device: &DeviceId) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_change_id FROM peer_cursors WHERE device_id = ?1",
                    [device.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Advance the cursor for `device` to a change id from its journal.
    /// The cursor never moves backwards.
    pub fn update_peer_cursor(&self, device: &DeviceId, change_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO peer_cursors (device_id, last_change_id, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(device_id) DO UPDATE SET
                    last_change_id = MAX(last_change_id, excluded.last_change_id),
                    updated_at = excluded.updated_at
                "#,
                params![device.as_str(), change_id, to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }
}

fn read_schema_version(conn: &Connection) -> Result<Option<u32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_meta WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| Error::InvalidInput(format!("corrupt schema version {:?}", v)))
        })
        .transpose()
}

/// Create the schema on a fresh database or upgrade an older one in place.
fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(BASE_SCHEMA)?;

    let current = read_schema_version(&tx)?.unwrap_or(1);
    if current > SCHEMA_VERSION {
        return Err(Error::InvalidInput(format!(
            "database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }

    for (idx, step) in MIGRATIONS.iter().enumerate() {
        let from = idx as u32 + 1;
        if current <= from {
            debug!("Migrating sync database from schema {} to {}", from, from + 1);
            tx.execute_batch(step)?;
        }
    }

    tx.execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
        params![SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Milliseconds since the epoch, the on-disk timestamp format.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`to_millis`]; out-of-range values clamp to the epoch.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_is_current() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_meta_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_meta("device_id").unwrap().is_none());
        db.set_meta("device_id", "abc").unwrap();
        assert_eq!(db.get_meta("device_id").unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_peer_cursor_never_moves_backwards() {
        let db = Database::open_in_memory().unwrap();
        let peer = DeviceId::new("peer-b").unwrap();
        assert_eq!(db.get_peer_cursor(&peer).unwrap(), None);

        db.update_peer_cursor(&peer, 10).unwrap();
        db.update_peer_cursor(&peer, 4).unwrap();
        assert_eq!(db.get_peer_cursor(&peer).unwrap(), Some(10));
    }

    #[test]
    fn test_closed_database_rejects_calls() {
        let db = Database::open_in_memory().unwrap();
        let clone = db.clone();
        db.close();
        db.close();
        assert!(clone.is_closed());
        assert!(matches!(clone.get_meta("x"), Err(Error::Closed)));
    }

    #[test]
    fn test_upgrades_version_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(BASE_SCHEMA).unwrap();
            conn.execute(
                "INSERT INTO sync_meta (key, value) VALUES ('schema_version', '1')",
                [],
            )
            .unwrap();
        }

        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
        let peer = DeviceId::new("peer").unwrap();
        db.update_peer_cursor(&peer, 1).unwrap();
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        {
            let db = Database::open(&path, Duration::from_secs(1)).unwrap();
            db.set_meta(SCHEMA_VERSION_KEY, "99").unwrap();
        }
        assert!(Database::open(&path, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vaultsync").join("sync.db");
        Database::open(&path, Duration::from_secs(1)).unwrap();
        assert!(path.exists());
    }
}
