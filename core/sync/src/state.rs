//! Current and historical version of every tracked file.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use vaultsync_common::{DeviceId, Result, VaultPath};

use crate::db::{from_millis, to_millis, Database};

/// The state of one path at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub path: VaultPath,
    pub content_hash: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Increases by one per recorded change to this path.
    pub version: i64,
    /// Device that produced this version.
    pub device_id: DeviceId,
    pub recorded_at: DateTime<Utc>,
}

struct VersionRow {
    path: String,
    content_hash: String,
    size: i64,
    mtime_ms: i64,
    version: i64,
    device_id: String,
    recorded_at: i64,
}

impl VersionRow {
    const COLUMNS: &'static str =
        "path, content_hash, size, mtime_ms, version, device_id, recorded_at";

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            content_hash: row.get(1)?,
            size: row.get(2)?,
            mtime_ms: row.get(3)?,
            version: row.get(4)?,
            device_id: row.get(5)?,
            recorded_at: row.get(6)?,
        })
    }

    fn insert(&self, tx: &Transaction<'_>, verb: &str, table: &str) -> rusqlite::Result<()> {
        let sql = format!(
            "{} INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            verb,
            table,
            Self::COLUMNS
        );
        tx.execute(
            &sql,
            params![
                self.path,
                self.content_hash,
                self.size,
                self.mtime_ms,
                self.version,
                self.device_id,
                self.recorded_at
            ],
        )?;
        Ok(())
    }

    fn into_version(self) -> Result<FileVersion> {
        Ok(FileVersion {
            path: VaultPath::parse(&self.path)?,
            content_hash: self.content_hash,
            size: self.size.max(0) as u64,
            mtime: from_millis(self.mtime_ms),
            version: self.version,
            device_id: DeviceId::new(self.device_id)?,
            recorded_at: from_millis(self.recorded_at),
        })
    }
}

/// Version tracking for the vault.
///
/// Holds exactly one current row per tracked path in `file_state` and an
/// append-only history in `file_versions`. History survives deletes, so a
/// re-created path continues numbering where it left off.
#[derive(Clone)]
pub struct SyncState {
    db: Database,
}

impl SyncState {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a new version of `path` and return its version number.
    ///
    /// This is the only mutator of current state content.
    pub fn record_version(
        &self,
        path: &VaultPath,
        content_hash: &str,
        size: u64,
        mtime: DateTime<Utc>,
        device_id: &DeviceId,
    ) -> Result<i64> {
        let key = path.as_string();
        let version = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = next_version(&tx, &key)?;
            let row = VersionRow {
                path: key.clone(),
                content_hash: content_hash.to_string(),
                size: size as i64,
                mtime_ms: to_millis(mtime),
                version,
                device_id: device_id.as_str().to_string(),
                recorded_at: to_millis(Utc::now()),
            };
            row.insert(&tx, "INSERT OR REPLACE", "file_state")?;
            row.insert(&tx, "INSERT", "file_versions")?;
            tx.commit()?;
            Ok(version)
        })?;
        debug!("Recorded {} v{} from {}", path, version, device_id);
        Ok(version)
    }

    /// Current version of `path`, if tracked.
    pub fn get_file_state(&self, path: &VaultPath) -> Result<Option<FileVersion>> {
        let row = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM file_state WHERE path = ?1",
                VersionRow::COLUMNS
            );
            Ok(conn
                .query_row(&sql, [path.as_string()], VersionRow::read)
                .optional()?)
        })?;
        row.map(VersionRow::into_version).transpose()
    }

    /// Cheap pre-check against the stored mtime and size; no hashing.
    ///
    /// Untracked paths always report a change.
    pub fn has_changed(&self, path: &VaultPath, mtime: DateTime<Utc>, size: u64) -> Result<bool> {
        let stored: Option<(i64, i64)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT mtime_ms, size FROM file_state WHERE path = ?1",
                    [path.as_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        Ok(match stored {
            Some((mtime_ms, stored_size)) => {
                mtime_ms != to_millis(mtime) || stored_size != size as i64
            }
            None => true,
        })
    }

    /// Update the stored mtime and size of a tracked path whose content is
    /// unchanged, so later `has_changed` checks pass without rehashing.
    pub fn refresh_stat(&self, path: &VaultPath, mtime: DateTime<Utc>, size: u64) -> Result<bool> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE file_state SET mtime_ms = ?2, size = ?3 WHERE path = ?1",
                params![path.as_string(), to_millis(mtime), size as i64],
            )?;
            Ok(updated > 0)
        })
    }

    /// Move the current state of `old` to `new` without a version bump.
    ///
    /// The carried version is also written to `new`'s history so the current
    /// version stays the maximum recorded one. If `new` already has a longer
    /// history, the carried row continues that numbering instead. Returns
    /// `false` when `old` was not tracked.
    pub fn handle_rename(&self, old: &VaultPath, new: &VaultPath) -> Result<bool> {
        let (old_key, new_key) = (old.as_string(), new.as_string());
        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let sql = format!(
                "SELECT {} FROM file_state WHERE path = ?1",
                VersionRow::COLUMNS
            );
            let Some(current) = tx.query_row(&sql, [&old_key], VersionRow::read).optional()?
            else {
                return Ok(false);
            };

            let version = current.version.max(next_version(&tx, &new_key)?);
            let moved = VersionRow {
                path: new_key.clone(),
                version,
                ..current
            };
            tx.execute("DELETE FROM file_state WHERE path = ?1", [&old_key])?;
            moved.insert(&tx, "INSERT OR REPLACE", "file_state")?;
            moved.insert(&tx, "INSERT OR IGNORE", "file_versions")?;
            tx.commit()?;
            debug!("Moved state {} -> {} at v{}", old, new, version);
            Ok(true)
        })
    }

    /// Drop current state for a deleted path. History is retained.
    pub fn remove_file(&self, path: &VaultPath) -> Result<bool> {
        self.db.with_conn(|conn| {
            let removed =
                conn.execute("DELETE FROM file_state WHERE path = ?1", [path.as_string()])?;
            Ok(removed > 0)
        })
    }

    /// Every currently tracked path.
    pub fn get_all_paths(&self) -> Result<HashSet<VaultPath>> {
        let keys = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM file_state")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })?;
        keys.iter().map(|k| VaultPath::parse(k)).collect()
    }

    /// Full history of `path`, oldest first.
    pub fn get_history(&self, path: &VaultPath) -> Result<Vec<FileVersion>> {
        let rows = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM file_versions WHERE path = ?1 ORDER BY version ASC",
                VersionRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([path.as_string()], VersionRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(VersionRow::into_version).collect()
    }

    /// One historical version of `path`.
    pub fn get_version(&self, path: &VaultPath, version: i64) -> Result<Option<FileVersion>> {
        let row = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM file_versions WHERE path = ?1 AND version = ?2",
                VersionRow::COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![path.as_string(), version], VersionRow::read)
                .optional()?)
        })?;
        row.map(VersionRow::into_version).transpose()
    }

    /// Number of currently tracked paths.
    pub fn tracked_count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM file_state", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }
}

/// One past the highest version ever recorded for `key`, current or historical.
fn next_version(tx: &Transaction<'_>, key: &str) -> Result<i64> {
    let max: Option<i64> = tx.query_row(
        "SELECT MAX(v) FROM ( \
             SELECT MAX(version) AS v FROM file_versions WHERE path = ?1 \
             UNION ALL \
             SELECT version AS v FROM file_state WHERE path = ?1 \
         )",
        [key],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}
