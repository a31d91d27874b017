//! Full-tree reconciliation against `SyncState`.
//!
//! New files become creates, tracked files whose mtime or size moved are
//! hashed and become modifies when the hash differs, and tracked files
//! missing from disk become deletes. An unchanged vault costs one stat per
//! file and no reads.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use vaultsync_common::{hash_file, DeviceId, PathFilter, Result, VaultPath};

use crate::changelog::{ChangeSource, ChangeType, FileChange};
use crate::state::SyncState;

/// Walks the vault and diffs it against tracked state.
#[derive(Clone)]
pub struct FullScanner {
    root: PathBuf,
    filter: PathFilter,
    state: SyncState,
    device_id: DeviceId,
}

impl FullScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        filter: PathFilter,
        state: SyncState,
        device_id: DeviceId,
    ) -> Self {
        Self {
            root: root.into(),
            filter,
            state,
            device_id,
        }
    }

    /// Compute the changes needed to bring state in line with disk.
    ///
    /// This is blocking I/O; async callers run it on the blocking pool.
    /// Entries that cannot be read are logged and skipped, the next scan
    /// retries them.
    pub fn scan(&self) -> Result<Vec<FileChange>> {
        let mut tracked = self.state.get_all_paths()?;
        let mut changes = Vec::new();
        let mut seen = 0usize;

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                VaultPath::from_fs(&self.root, entry.path())
                    .map(|dir| !self.filter.is_ignored_dir(&dir))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Scan skipped an entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = match VaultPath::from_fs(&self.root, entry.path()) {
                Ok(path) => path,
                Err(e) => {
                    debug!("Scan skipped {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if !self.filter.accepts(&path) {
                continue;
            }
            seen += 1;
            let is_tracked = tracked.remove(&path);

            match self.examine(&path, entry.path(), is_tracked) {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(e) => warn!("Scan skipped {}: {}", path, e),
            }
        }

        for missing in tracked {
            // a path that stopped matching the filter is left alone
            if !self.filter.accepts(&missing) || missing.to_fs(&self.root).exists() {
                continue;
            }
            changes.push(FileChange::deleted(
                missing,
                ChangeSource::Scan,
                self.device_id.clone(),
            ));
        }

        info!("Scanned {} documents, {} changes", seen, changes.len());
        Ok(changes)
    }

    fn examine(
        &self,
        path: &VaultPath,
        fs_path: &Path,
        is_tracked: bool,
    ) -> Result<Option<FileChange>> {
        let meta = std::fs::metadata(fs_path)?;
        let mtime = DateTime::<Utc>::from(meta.modified()?);
        let size = meta.len();

        let change_type = if is_tracked {
            if !self.state.has_changed(path, mtime, size)? {
                return Ok(None);
            }
            ChangeType::Modify
        } else {
            ChangeType::Create
        };

        let hash = hash_file(fs_path)?;
        if change_type == ChangeType::Modify {
            let unchanged = self
                .state
                .get_file_state(path)?
                .is_some_and(|current| current.content_hash == hash);
            if unchanged {
                // touched but identical
                self.state.refresh_stat(path, mtime, size)?;
                return Ok(None);
            }
        }

        Ok(Some(FileChange::written(
            path.clone(),
            change_type,
            hash,
            size,
            mtime,
            ChangeSource::Scan,
            self.device_id.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::fs;
    use tempfile::TempDir;
    use vaultsync_common::content_hash;

    fn setup() -> (TempDir, SyncState, FullScanner) {
        let dir = TempDir::new().unwrap();
        let state = SyncState::new(Database::open_in_memory().unwrap());
        let scanner = FullScanner::new(
            dir.path(),
            PathFilter::default(),
            state.clone(),
            DeviceId::new("device-a").unwrap(),
        );
        (dir, state, scanner)
    }

    fn apply(state: &SyncState, changes: &[FileChange]) {
        for change in changes {
            match change.change_type {
                ChangeType::Delete => {
                    state.remove_file(&change.path).unwrap();
                }
                _ => {
                    state
                        .record_version(
                            &change.path,
                            change.content_hash.as_deref().unwrap(),
                            change.size,
                            change.mtime,
                            &change.device_id,
                        )
                        .unwrap();
                }
            }
        }
    }

    #[test]
    fn test_scan_detects_new_files() {
        let (dir, _state, scanner) = setup();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/new.md"), "hello").unwrap();
        fs::write(dir.path().join("readme.txt"), "not a document").unwrap();
        fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        fs::write(dir.path().join(".obsidian/workspace.md"), "ignored").unwrap();

        let changes = scanner.scan().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path.as_string(), "notes/new.md");
        assert_eq!(changes[0].change_type, ChangeType::Create);
        assert_eq!(changes[0].source, ChangeSource::Scan);
        assert_eq!(changes[0].content_hash, Some(content_hash(b"hello")));
    }

    #[test]
    fn test_unchanged_vault_produces_nothing() {
        let (dir, state, scanner) = setup();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        fs::write(dir.path().join("b.md"), "b").unwrap();

        let first = scanner.scan().unwrap();
        assert_eq!(first.len(), 2);
        apply(&state, &first);

        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn test_scan_detects_modify_and_delete() {
        let (dir, state, scanner) = setup();
        fs::write(dir.path().join("keep.md"), "v1").unwrap();
        fs::write(dir.path().join("gone.md"), "bye").unwrap();
        apply(&state, &scanner.scan().unwrap());

        fs::write(dir.path().join("keep.md"), "version two").unwrap();
        fs::remove_file(dir.path().join("gone.md")).unwrap();

        let mut changes = scanner.scan().unwrap();
        changes.sort_by(|a, b| a.path.as_string().cmp(&b.path.as_string()));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path.as_string(), "gone.md");
        assert_eq!(changes[0].change_type, ChangeType::Delete);
        assert_eq!(changes[1].path.as_string(), "keep.md");
        assert_eq!(changes[1].change_type, ChangeType::Modify);
    }

    #[test]
    fn test_touched_but_identical_is_not_a_change() {
        let (dir, state, scanner) = setup();
        let file = dir.path().join("a.md");
        fs::write(&file, "same").unwrap();
        let path = VaultPath::parse("a.md").unwrap();
        let stale = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        state
            .record_version(&path, &content_hash(b"same"), 4, stale, &DeviceId::new("device-a").unwrap())
            .unwrap();

        assert!(scanner.scan().unwrap().is_empty());
        assert_eq!(state.get_file_state(&path).unwrap().unwrap().version, 1);
        assert!(!state
            .has_changed(&path, DateTime::<Utc>::from(fs::metadata(&file).unwrap().modified().unwrap()), 4)
            .unwrap());
    }
}
