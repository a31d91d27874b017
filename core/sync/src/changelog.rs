//! Append-only change journal with per-consumer cursors.
//!
//! `change_id` order is the authoritative total order of changes recorded
//! by this device. Ids come from an AUTOINCREMENT column, so they are never
//! reused, even after compaction removes old rows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use vaultsync_common::{DeviceId, Error, Result, VaultPath};

use crate::db::{from_millis, to_millis, Database};

/// Kind of filesystem mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
    Rename,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Modify => "modify",
            ChangeType::Delete => "delete",
            ChangeType::Rename => "rename",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ChangeType::Create),
            "modify" => Ok(ChangeType::Modify),
            "delete" => Ok(ChangeType::Delete),
            "rename" => Ok(ChangeType::Rename),
            other => Err(Error::InvalidInput(format!("unknown change type {:?}", other))),
        }
    }
}

/// Which detector or entry point produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Watcher,
    Scan,
    Api,
    Remote,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Watcher => "watcher",
            ChangeSource::Scan => "scan",
            ChangeSource::Api => "api",
            ChangeSource::Remote => "remote",
        }
    }
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "watcher" => Ok(ChangeSource::Watcher),
            "scan" => Ok(ChangeSource::Scan),
            "api" => Ok(ChangeSource::Api),
            "remote" => Ok(ChangeSource::Remote),
            other => Err(Error::InvalidInput(format!("unknown change source {:?}", other))),
        }
    }
}

/// An observed filesystem mutation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Vault-relative path (the new path for renames).
    pub path: VaultPath,
    /// Previous path, set only for renames.
    pub old_path: Option<VaultPath>,
    pub change_type: ChangeType,
    /// SHA-256 of the content; `None` for deletes.
    pub content_hash: Option<String>,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub source: ChangeSource,
    pub device_id: DeviceId,
}

impl FileChange {
    /// A new or updated document.
    pub fn written(
        path: VaultPath,
        change_type: ChangeType,
        content_hash: String,
        size: u64,
        mtime: DateTime<Utc>,
        source: ChangeSource,
        device_id: DeviceId,
    ) -> Self {
        Self {
            path,
            old_path: None,
            change_type,
            content_hash: Some(content_hash),
            size,
            mtime,
            detected_at: Utc::now(),
            source,
            device_id,
        }
    }

    /// A removed document.
    pub fn deleted(path: VaultPath, source: ChangeSource, device_id: DeviceId) -> Self {
        let now = Utc::now();
        Self {
            path,
            old_path: None,
            change_type: ChangeType::Delete,
            content_hash: None,
            size: 0,
            mtime: now,
            detected_at: now,
            source,
            device_id,
        }
    }

    /// A document moved from `old_path` to `path`.
    pub fn renamed(
        old_path: VaultPath,
        path: VaultPath,
        content_hash: String,
        size: u64,
        mtime: DateTime<Utc>,
        source: ChangeSource,
        device_id: DeviceId,
    ) -> Self {
        Self {
            path,
            old_path: Some(old_path),
            change_type: ChangeType::Rename,
            content_hash: Some(content_hash),
            size,
            mtime,
            detected_at: Utc::now(),
            source,
            device_id,
        }
    }

    /// Override the detection timestamp.
    pub fn with_detected_at(mut self, at: DateTime<Utc>) -> Self {
        self.detected_at = at;
        self
    }
}

/// A journal row: a change plus its assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedChange {
    pub change_id: i64,
    #[serde(flatten)]
    pub change: FileChange,
}

/// Columns of a `changes` row before they are parsed into typed values.
struct ChangeRow {
    change_id: i64,
    path: String,
    old_path: Option<String>,
    change_type: String,
    content_hash: Option<String>,
    size: i64,
    mtime_ms: i64,
    detected_at: i64,
    source: String,
    device_id: String,
}

impl ChangeRow {
    const COLUMNS: &'static str = "change_id, path, old_path, change_type, content_hash, \
                                   size, mtime_ms, detected_at, source, device_id";

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            change_id: row.get(0)?,
            path: row.get(1)?,
            old_path: row.get(2)?,
            change_type: row.get(3)?,
            content_hash: row.get(4)?,
            size: row.get(5)?,
            mtime_ms: row.get(6)?,
            detected_at: row.get(7)?,
            source: row.get(8)?,
            device_id: row.get(9)?,
        })
    }

    fn into_logged(self) -> Result<LoggedChange> {
        Ok(LoggedChange {
            change_id: self.change_id,
            change: FileChange {
                path: VaultPath::parse(&self.path)?,
                old_path: self.old_path.as_deref().map(VaultPath::parse).transpose()?,
                change_type: self.change_type.parse()?,
                content_hash: self.content_hash,
                size: self.size.max(0) as u64,
                mtime: from_millis(self.mtime_ms),
                detected_at: from_millis(self.detected_at),
                source: self.source.parse()?,
                device_id: DeviceId::new(self.device_id)?,
            },
        })
    }
}

/// The durable, ordered journal of detected changes.
#[derive(Clone)]
pub struct ChangeLog {
    db: Database,
}

impl ChangeLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a change and return its newly assigned `change_id`.
    pub fn append(&self, change: &FileChange) -> Result<i64> {
        let id = self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO changes
                (path, old_path, change_type, content_hash, size, mtime_ms, detected_at, source, device_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    change.path.as_string(),
                    change.old_path.as_ref().map(VaultPath::as_string),
                    change.change_type.as_str(),
                    change.content_hash,
                    change.size as i64,
                    to_millis(change.mtime),
                    to_millis(change.detected_at),
                    change.source.as_str(),
                    change.device_id.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(
            "Journaled change {}: {} {} ({})",
            id, change.change_type, change.path, change.source
        );
        Ok(id)
    }

    /// All changes with `change_id > after`, ascending.
    pub fn get_changes_after(&self, after: i64) -> Result<Vec<LoggedChange>> {
        self.query_after(after, None)
    }

    /// At most `limit` changes with `change_id > after`, ascending.
    pub fn get_changes_after_limit(&self, after: i64, limit: usize) -> Result<Vec<LoggedChange>> {
        self.query_after(after, Some(limit))
    }

    fn query_after(&self, after: i64, limit: Option<usize>) -> Result<Vec<LoggedChange>> {
        let rows = self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM changes WHERE change_id > ?1 ORDER BY change_id ASC LIMIT ?2",
                ChangeRow::COLUMNS
            );
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![after, limit], ChangeRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(ChangeRow::into_logged).collect()
    }

    /// Last acknowledged change id for a consumer, 0 if it has never read.
    pub fn get_cursor(&self, consumer_id: &str) -> Result<i64> {
        self.db.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT last_change_id FROM cursors WHERE consumer_id = ?1",
                    [consumer_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.unwrap_or(0))
        })
    }

    /// Set a consumer's read position.
    pub fn update_cursor(&self, consumer_id: &str, change_id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cursors (consumer_id, last_change_id, updated_at) \
                 VALUES (?1, ?2, ?3)",
                params![consumer_id, change_id, to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Unread changes for a consumer, oldest first.
    ///
    /// Reading does not move the cursor; call [`ChangeLog::acknowledge`]
    /// after processing so a crash mid-batch redelivers.
    pub fn read_pending(&self, consumer_id: &str, limit: usize) -> Result<Vec<LoggedChange>> {
        let cursor = self.get_cursor(consumer_id)?;
        self.get_changes_after_limit(cursor, limit)
    }

    /// Advance a consumer's cursor to `change_id`. Never moves it backwards.
    pub fn acknowledge(&self, consumer_id: &str, change_id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO cursors (consumer_id, last_change_id, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(consumer_id) DO UPDATE SET
                    last_change_id = MAX(last_change_id, excluded.last_change_id),
                    updated_at = excluded.updated_at
                "#,
                params![consumer_id, change_id, to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Delete journal rows detected more than `retention_days` ago.
    ///
    /// Version history is untouched. Retention must exceed the maximum
    /// consumer lag; cursors are not consulted.
    pub fn compact(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        self.compact_before(cutoff)
    }

    /// Delete journal rows detected strictly before `cutoff`.
    pub fn compact_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM changes WHERE detected_at < ?1",
                params![to_millis(cutoff)],
            )?)
        })?;
        info!("Compacted {} journal rows older than {}", removed, cutoff);
        Ok(removed)
    }

    /// Number of rows currently in the journal.
    pub fn count(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    /// Highest change id ever assigned, 0 for an empty journal.
    pub fn latest_change_id(&self) -> Result<i64> {
        self.db.with_conn(|conn| {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = 'changes'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id.unwrap_or(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device() -> DeviceId {
        DeviceId::new("device-a").unwrap()
    }

    fn change(path: &str, change_type: ChangeType) -> FileChange {
        FileChange::written(
            VaultPath::parse(path).unwrap(),
            change_type,
            format!("hash-{}", path),
            12,
            Utc::now(),
            ChangeSource::Watcher,
            device(),
        )
    }

    fn log() -> ChangeLog {
        ChangeLog::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_append_and_read_back() {
        let log = log();
        let created = change("tasks/pending/t1.md", ChangeType::Create);
        let id = log.append(&created).unwrap();

        let changes = log.get_changes_after(0).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_id, id);
        assert_eq!(changes[0].change.path, created.path);
        assert_eq!(changes[0].change.change_type, ChangeType::Create);
        assert_eq!(changes[0].change.source, ChangeSource::Watcher);
        assert_eq!(
            changes[0].change.mtime.timestamp_millis(),
            created.mtime.timestamp_millis()
        );
    }

    #[test]
    fn test_rename_and_delete_columns() {
        let log = log();
        let renamed = FileChange::renamed(
            VaultPath::parse("jobs/pending/1.md").unwrap(),
            VaultPath::parse("jobs/running/1.md").unwrap(),
            "h".to_string(),
            3,
            Utc::now(),
            ChangeSource::Watcher,
            device(),
        );
        log.append(&renamed).unwrap();
        log.append(&FileChange::deleted(
            VaultPath::parse("notes/x.md").unwrap(),
            ChangeSource::Scan,
            device(),
        ))
        .unwrap();

        let changes = log.get_changes_after(0).unwrap();
        assert_eq!(
            changes[0].change.old_path.as_ref().map(|p| p.to_string()),
            Some("jobs/pending/1.md".to_string())
        );
        assert_eq!(changes[1].change.change_type, ChangeType::Delete);
        assert!(changes[1].change.content_hash.is_none());
    }

    #[test]
    fn test_get_changes_after_cursor() {
        let log = log();
        let ids: Vec<i64> = (0..5)
            .map(|i| log.append(&change(&format!("notes/{}.md", i), ChangeType::Create)).unwrap())
            .collect();

        let tail = log.get_changes_after(ids[2]).unwrap();
        assert_eq!(
            tail.iter().map(|c| c.change_id).collect::<Vec<_>>(),
            vec![ids[3], ids[4]]
        );
        assert_eq!(log.get_changes_after_limit(0, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_cursors_are_independent() {
        let log = log();
        let first = log.append(&change("a.md", ChangeType::Create)).unwrap();
        log.append(&change("b.md", ChangeType::Create)).unwrap();

        assert_eq!(log.get_cursor("agent").unwrap(), 0);
        log.update_cursor("agent", first).unwrap();
        assert_eq!(log.get_cursor("agent").unwrap(), first);
        assert_eq!(log.get_cursor("bot").unwrap(), 0);

        assert_eq!(log.read_pending("agent", 10).unwrap().len(), 1);
        assert_eq!(log.read_pending("bot", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_acknowledge_never_rewinds() {
        let log = log();
        log.acknowledge("agent", 7).unwrap();
        log.acknowledge("agent", 3).unwrap();
        assert_eq!(log.get_cursor("agent").unwrap(), 7);
    }

    #[test]
    fn test_compact_removes_only_old_rows() {
        let log = log();
        let old = change("old.md", ChangeType::Create)
            .with_detected_at(Utc::now() - ChronoDuration::days(10));
        log.append(&old).unwrap();
        log.append(&change("today.md", ChangeType::Create)).unwrap();

        assert_eq!(log.compact(7).unwrap(), 1);
        assert_eq!(log.count().unwrap(), 1);
        assert_eq!(
            log.get_changes_after(0).unwrap()[0].change.path.to_string(),
            "today.md"
        );
    }

    #[test]
    fn test_ids_not_reused_after_compaction() {
        let log = log();
        let first = log
            .append(&change("a.md", ChangeType::Create).with_detected_at(
                Utc::now() - ChronoDuration::days(30),
            ))
            .unwrap();
        log.compact(1).unwrap();
        let next = log.append(&change("b.md", ChangeType::Create)).unwrap();
        assert!(next > first);
        assert_eq!(log.latest_change_id().unwrap(), next);
    }

    proptest! {
        #[test]
        fn prop_append_ids_strictly_increase(count in 1usize..30, pivot in 0usize..30) {
            let log = log();
            let ids: Vec<i64> = (0..count)
                .map(|i| log.append(&change(&format!("n/{}.md", i), ChangeType::Modify)).unwrap())
                .collect();
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));

            let after = ids[pivot.min(count - 1)];
            let tail: Vec<i64> = log
                .get_changes_after(after)
                .unwrap()
                .iter()
                .map(|c| c.change_id)
                .collect();
            let expected: Vec<i64> = ids.iter().copied().filter(|id| *id > after).collect();
            prop_assert_eq!(tail, expected);
        }
    }
}
