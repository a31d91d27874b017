//! Conflict detection and resolution between devices.
//!
//! A conflict exists when a remote change disagrees with local state for the
//! same path and the two versions come from different devices. Whatever the
//! strategy, the losing bytes are written next to the original as
//! `<stem>.sync-conflict-<timestamp>-<device8><.ext>` before the conflict is
//! recorded as resolved.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use vaultsync_common::{DeviceId, Error, Result, VaultPath};

use crate::changelog::{ChangeType, FileChange};
use crate::db::{from_millis, to_millis, Database};
use crate::state::FileVersion;

/// Length of the device id prefix embedded in conflict file names.
const DEVICE_PREFIX_LEN: usize = 8;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Newer version wins the body; front-matter fields are merged with the
    /// winner's values taking precedence.
    #[default]
    MergeFrontmatter,
    /// Newer version wins the whole file; ties go to the larger device id.
    NewerWins,
    /// Keep the local file and leave the decision to the user.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::MergeFrontmatter => "merge-frontmatter",
            ConflictStrategy::NewerWins => "newer-wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge-frontmatter" => Ok(ConflictStrategy::MergeFrontmatter),
            "newer-wins" => Ok(ConflictStrategy::NewerWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict strategy {:?}",
                other
            ))),
        }
    }
}

/// Which side's content ends up at the original path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

impl Winner {
    fn as_str(&self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Remote => "remote",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Winner::Local),
            "remote" => Ok(Winner::Remote),
            other => Err(Error::InvalidInput(format!("unknown winner {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    Auto,
    Manual,
}

impl ResolvedBy {
    fn as_str(&self) -> &'static str {
        match self {
            ResolvedBy::Auto => "auto",
            ResolvedBy::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ResolvedBy::Auto),
            "manual" => Ok(ResolvedBy::Manual),
            other => Err(Error::InvalidInput(format!("unknown resolver {:?}", other))),
        }
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub winner: Winner,
    /// Where the losing content was preserved.
    pub loser_path: VaultPath,
    /// `None` while a manual conflict awaits a decision.
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: ResolvedBy,
}

/// A detected divergence between a local and a remote version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub path: VaultPath,
    pub local_version: FileVersion,
    pub remote_version: FileVersion,
    pub strategy: ConflictStrategy,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Detected but not yet settled (unresolved, or manual and awaiting a decision).
    pub fn is_pending(&self) -> bool {
        self.resolution
            .as_ref()
            .map_or(true, |r| r.resolved_at.is_none())
    }
}

/// Detects conflicts, preserves losing content and records outcomes.
#[derive(Clone)]
pub struct ConflictResolver {
    db: Database,
    root: PathBuf,
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(db: Database, root: impl Into<PathBuf>, strategy: ConflictStrategy) -> Self {
        Self {
            db,
            root: root.into(),
            strategy,
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Compare a remote change against local state for the same path.
    ///
    /// Only content-bearing remote changes can conflict. Equal hashes, an
    /// untracked path, or a remote change produced by the same device that
    /// wrote the local version are not conflicts.
    pub fn detect_conflict(
        &self,
        local: Option<&FileVersion>,
        remote: &FileChange,
    ) -> Option<Conflict> {
        if !matches!(remote.change_type, ChangeType::Create | ChangeType::Modify) {
            return None;
        }
        let local = local?;
        let remote_hash = remote.content_hash.as_ref()?;
        if *remote_hash == local.content_hash || remote.device_id == local.device_id {
            return None;
        }

        let remote_version = FileVersion {
            path: remote.path.clone(),
            content_hash: remote_hash.clone(),
            size: remote.size,
            mtime: remote.mtime,
            version: local.version + 1,
            device_id: remote.device_id.clone(),
            recorded_at: remote.detected_at,
        };

        Some(Conflict {
            conflict_id: uuid::Uuid::new_v4().to_string(),
            path: remote.path.clone(),
            local_version: local.clone(),
            remote_version,
            strategy: self.strategy,
            detected_at: Utc::now(),
            resolution: None,
        })
    }

    /// Resolve `conflict` with the configured strategy and persist it.
    ///
    /// With `remote_content` the remote bytes are staged apart from the
    /// vault file: the loser is written to the conflict path and the merged
    /// or winning content to the original path. A staged change for a file
    /// that is gone from disk treats the local side as empty; unless the
    /// strategy is manual the remote content wins and an empty copy marks
    /// the lost local side.
    ///
    /// Without staged content the remote side has already been written over
    /// the vault file, so the on-disk bytes are preserved at the conflict
    /// path and only the verdict is recorded. The copy is still named after
    /// the losing device even when those bytes are the remote winner's; the
    /// local bytes were overwritten before the engine saw them.
    pub fn resolve(&self, mut conflict: Conflict, remote_content: Option<&[u8]>) -> Result<Conflict> {
        if conflict.resolution.is_some() {
            return Err(Error::Conflict(format!(
                "conflict {} on {} is already resolved",
                conflict.conflict_id, conflict.path
            )));
        }
        let target = conflict.path.to_fs(&self.root);
        let local_missing = !target.exists();
        if local_missing && remote_content.is_none() {
            return Err(Error::NotFound(format!(
                "{} is missing and no remote content is staged",
                conflict.path
            )));
        }
        let winner = match conflict.strategy {
            ConflictStrategy::Manual => Winner::Local,
            _ if local_missing => Winner::Remote,
            _ => pick_winner(&conflict.local_version, &conflict.remote_version),
        };
        let loser_device = match winner {
            Winner::Local => &conflict.remote_version.device_id,
            Winner::Remote => &conflict.local_version.device_id,
        };
        let loser_path = self.conflict_path(&conflict.path, loser_device, Utc::now())?;

        match remote_content {
            Some(remote_bytes) => {
                let local_bytes = match fs::read(&target) {
                    Ok(bytes) => bytes,
                    // deleted locally, not yet rescanned
                    Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                let (winner_bytes, loser_bytes) = match winner {
                    Winner::Local => (local_bytes.as_slice(), remote_bytes),
                    Winner::Remote => (remote_bytes, local_bytes.as_slice()),
                };
                write_atomic(&loser_path.to_fs(&self.root), loser_bytes)?;

                let resolved = match conflict.strategy {
                    ConflictStrategy::MergeFrontmatter => {
                        match (std::str::from_utf8(winner_bytes), std::str::from_utf8(loser_bytes)) {
                            (Ok(w), Ok(l)) => merge_frontmatter(w, l).into_bytes(),
                            _ => winner_bytes.to_vec(),
                        }
                    }
                    ConflictStrategy::NewerWins => winner_bytes.to_vec(),
                    ConflictStrategy::Manual => local_bytes.clone(),
                };
                if resolved != local_bytes || (local_missing && winner == Winner::Remote) {
                    write_atomic(&target, &resolved)?;
                }
            }
            None => {
                fs::copy(&target, loser_path.to_fs(&self.root))?;
            }
        }

        let manual = conflict.strategy == ConflictStrategy::Manual;
        conflict.resolution = Some(ConflictResolution {
            winner,
            loser_path: loser_path.clone(),
            resolved_at: if manual { None } else { Some(Utc::now()) },
            resolved_by: if manual {
                ResolvedBy::Manual
            } else {
                ResolvedBy::Auto
            },
        });
        self.save(&conflict)?;

        info!(
            "Conflict on {} resolved by {}: {} wins, loser kept at {}",
            conflict.path,
            conflict.strategy,
            winner.as_str(),
            loser_path
        );
        Ok(conflict)
    }

    /// Conflict copy path for `original`, made unique against the vault.
    pub fn conflict_path(
        &self,
        original: &VaultPath,
        loser_device: &DeviceId,
        at: DateTime<Utc>,
    ) -> Result<VaultPath> {
        let stem = original
            .file_stem()
            .ok_or_else(|| Error::InvalidInput("Root path cannot conflict".to_string()))?;
        let ext = original
            .extension()
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let base = format!(
            "{}.sync-conflict-{}-{}",
            stem,
            at.format("%Y%m%d-%H%M%S"),
            loser_device.prefix(DEVICE_PREFIX_LEN)
        );

        let mut candidate = original.with_name(&format!("{}{}", base, ext))?;
        let mut n = 2;
        while candidate.to_fs(&self.root).exists() {
            candidate = original.with_name(&format!("{}-{}{}", base, n, ext))?;
            n += 1;
        }
        Ok(candidate)
    }

    fn save(&self, conflict: &Conflict) -> Result<()> {
        let local = to_json(&conflict.local_version)?;
        let remote = to_json(&conflict.remote_version)?;
        let resolution = conflict.resolution.as_ref();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO conflicts (conflict_id, path, local_version, \
                 remote_version, strategy, detected_at, winner, loser_path, resolved_at, \
                 resolved_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    conflict.conflict_id,
                    conflict.path.as_string(),
                    local,
                    remote,
                    conflict.strategy.as_str(),
                    to_millis(conflict.detected_at),
                    resolution.map(|r| r.winner.as_str()),
                    resolution.map(|r| r.loser_path.as_string()),
                    resolution.and_then(|r| r.resolved_at).map(to_millis),
                    resolution.map(|r| r.resolved_by.as_str()),
                ],
            )?;
            Ok(())
        })
    }

    /// Look up one recorded conflict.
    pub fn get(&self, conflict_id: &str) -> Result<Option<Conflict>> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM conflicts WHERE conflict_id = ?1", ConflictRow::COLUMNS),
                    [conflict_id],
                    ConflictRow::read,
                )
                .optional()?)
        })?;
        row.map(ConflictRow::into_conflict).transpose()
    }

    /// Recorded conflicts, oldest first. With `pending_only`, only those
    /// still awaiting a decision.
    pub fn list(&self, pending_only: bool) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {} FROM conflicts {} ORDER BY detected_at, conflict_id",
            ConflictRow::COLUMNS,
            if pending_only {
                "WHERE resolved_at IS NULL"
            } else {
                ""
            }
        );
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], ConflictRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(ConflictRow::into_conflict).collect()
    }

    /// Settle a pending conflict by hand. Returns `false` if the conflict is
    /// unknown or already settled.
    pub fn mark_resolved(&self, conflict_id: &str, winner: Winner) -> Result<bool> {
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE conflicts SET winner = ?2, resolved_at = ?3, resolved_by = 'manual' \
                 WHERE conflict_id = ?1 AND resolved_at IS NULL",
                params![conflict_id, winner.as_str(), to_millis(Utc::now())],
            )?)
        })?;
        if updated > 0 {
            info!("Conflict {} settled manually: {} wins", conflict_id, winner.as_str());
        }
        Ok(updated > 0)
    }
}

struct ConflictRow {
    conflict_id: String,
    path: String,
    local_version: String,
    remote_version: String,
    strategy: String,
    detected_at: i64,
    winner: Option<String>,
    loser_path: Option<String>,
    resolved_at: Option<i64>,
    resolved_by: Option<String>,
}

impl ConflictRow {
    const COLUMNS: &'static str = "conflict_id, path, local_version, remote_version, strategy, \
         detected_at, winner, loser_path, resolved_at, resolved_by";

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conflict_id: row.get(0)?,
            path: row.get(1)?,
            local_version: row.get(2)?,
            remote_version: row.get(3)?,
            strategy: row.get(4)?,
            detected_at: row.get(5)?,
            winner: row.get(6)?,
            loser_path: row.get(7)?,
            resolved_at: row.get(8)?,
            resolved_by: row.get(9)?,
        })
    }

    fn into_conflict(self) -> Result<Conflict> {
        let resolution = match (self.winner, self.loser_path, self.resolved_by) {
            (Some(winner), Some(loser_path), Some(resolved_by)) => Some(ConflictResolution {
                winner: Winner::parse(&winner)?,
                loser_path: VaultPath::parse(&loser_path)?,
                resolved_at: self.resolved_at.map(from_millis),
                resolved_by: ResolvedBy::parse(&resolved_by)?,
            }),
            _ => None,
        };
        Ok(Conflict {
            conflict_id: self.conflict_id,
            path: VaultPath::parse(&self.path)?,
            local_version: from_json(&self.local_version)?,
            remote_version: from_json(&self.remote_version)?,
            strategy: self.strategy.parse()?,
            detected_at: from_millis(self.detected_at),
            resolution,
        })
    }
}

fn to_json(version: &FileVersion) -> Result<String> {
    serde_json::to_string(version).map_err(|e| Error::Serialization(e.to_string()))
}

fn from_json(json: &str) -> Result<FileVersion> {
    serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
}

/// Newer modification time wins; on an exact tie the lexicographically
/// larger device id wins, so every device reaches the same verdict.
pub fn pick_winner(local: &FileVersion, remote: &FileVersion) -> Winner {
    match local.mtime.cmp(&remote.mtime) {
        std::cmp::Ordering::Greater => Winner::Local,
        std::cmp::Ordering::Less => Winner::Remote,
        std::cmp::Ordering::Equal => {
            if remote.device_id > local.device_id {
                Winner::Remote
            } else {
                Winner::Local
            }
        }
    }
}

/// A `---` delimited front-matter block split into top-level fields.
struct FrontMatter<'a> {
    /// `(key, lines)` in document order; `lines` includes continuation lines.
    fields: Vec<(&'a str, Vec<&'a str>)>,
    body: &'a str,
}

fn split_frontmatter(doc: &str) -> Option<FrontMatter<'_>> {
    let rest = doc
        .strip_prefix("---\n")
        .or_else(|| doc.strip_prefix("---\r\n"))?;

    let mut fields: Vec<(&str, Vec<&str>)> = Vec::new();
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" {
            return Some(FrontMatter {
                fields,
                body: &rest[offset..],
            });
        }
        let is_continuation = trimmed.starts_with([' ', '\t', '-']) || trimmed.is_empty();
        match (is_continuation, fields.last_mut()) {
            (true, Some((_, lines))) => lines.push(trimmed),
            _ => {
                let key = trimmed.split(':').next().unwrap_or(trimmed).trim();
                fields.push((key, vec![trimmed]));
            }
        }
    }
    None
}

/// Merge two documents field by field.
///
/// The winner's body and front-matter values are kept; fields only the loser
/// has are appended. Documents without front matter fall back to the winner.
pub fn merge_frontmatter(winner: &str, loser: &str) -> String {
    let Some(loser_fm) = split_frontmatter(loser) else {
        return winner.to_string();
    };
    let (mut fields, body) = match split_frontmatter(winner) {
        Some(fm) => (fm.fields, fm.body),
        None => (Vec::new(), winner),
    };

    for (key, lines) in loser_fm.fields {
        if !fields.iter().any(|(k, _)| *k == key) {
            fields.push((key, lines));
        }
    }

    let mut out = String::from("---\n");
    for line in fields.iter().flat_map(|(_, lines)| lines) {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(body);
    out
}

/// Write `bytes` to `target` through a sibling temp file and a rename.
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("invalid target {}", target.display())))?;
    let tmp = target.with_file_name(format!(
        ".{}.vaultsync-tmp-{}",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, target) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            warn!("Failed to remove temp file {}: {}", tmp.display(), cleanup);
        }
        return Err(e.into());
    }
    debug!("Wrote {} bytes to {}", bytes.len(), target.display());
    Ok(())
}
