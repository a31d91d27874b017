//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use vaultsync_common::filter::{DEFAULT_DOCUMENT_EXTENSIONS, DEFAULT_IGNORE_PATTERNS};
use vaultsync_common::{DeviceId, Error, PathFilter, Result};

use crate::classify::{default_rules, ClassificationRule};
use crate::conflict::ConflictStrategy;
use crate::watcher::WatchTimings;

/// Engine metadata directory inside the vault root.
pub const META_DIRNAME: &str = ".vaultsync";

/// Database file name inside [`META_DIRNAME`].
pub const DB_FILENAME: &str = "sync.db";

/// Optional configuration file inside [`META_DIRNAME`].
pub const CONFIG_FILENAME: &str = "config.json";

/// Sync engine configuration. Every field has a default, so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Database file; defaults to `<vault>/.vaultsync/sync.db`.
    pub database_path: Option<PathBuf>,
    /// Local device id; defaults to the one persisted in the database,
    /// generated on first open.
    pub device_id: Option<DeviceId>,
    pub debounce_ms: u64,
    pub stability_ms: u64,
    /// Safety-net scan period; 0 disables periodic scans.
    pub scan_interval_secs: u64,
    /// Expired lock cleanup period; 0 disables it.
    pub lock_cleanup_interval_secs: u64,
    /// Lease used by the engine's `with_lock`.
    pub default_lock_ttl_ms: u64,
    pub busy_timeout_ms: u64,
    pub conflict_strategy: ConflictStrategy,
    /// Vault-relative glob patterns excluded from tracking.
    pub ignore_patterns: Vec<String>,
    /// Extensions of tracked documents, without the dot.
    pub document_extensions: Vec<String>,
    /// Run the live watcher; when off, scans are the only detector.
    pub watch: bool,
    pub classification_rules: Vec<ClassificationRule>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            device_id: None,
            debounce_ms: 300,
            stability_ms: 1000,
            scan_interval_secs: 300,
            lock_cleanup_interval_secs: 60,
            default_lock_ttl_ms: 30_000,
            busy_timeout_ms: 5_000,
            conflict_strategy: ConflictStrategy::default(),
            ignore_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            document_extensions: DEFAULT_DOCUMENT_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            watch: true,
            classification_rules: default_rules(),
        }
    }
}

impl SyncConfig {
    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Load `<vault>/.vaultsync/config.json` if present, defaults otherwise.
    pub fn load_for_vault(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(META_DIRNAME).join(CONFIG_FILENAME);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Database location for a vault rooted at `root`.
    pub fn database_path_for(&self, root: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| root.join(META_DIRNAME).join(DB_FILENAME))
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        PathFilter::new(&self.ignore_patterns, &self.document_extensions)
    }

    pub fn watch_timings(&self) -> WatchTimings {
        WatchTimings {
            debounce: Duration::from_millis(self.debounce_ms),
            stability: Duration::from_millis(self.stability_ms),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn lock_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.lock_cleanup_interval_secs)
    }

    pub fn default_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.default_lock_ttl_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce_ms, 300);
        assert_eq!(config.stability_ms, 1000);
        assert_eq!(config.conflict_strategy, ConflictStrategy::MergeFrontmatter);
        assert!(config.watch);
        assert_eq!(
            config.database_path_for(Path::new("/vault")),
            Path::new("/vault/.vaultsync/sync.db")
        );
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = SyncConfig::from_json(
            r#"{ "debounce_ms": 50, "conflict_strategy": "newer-wins", "device_id": "laptop" }"#,
        )
        .unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.stability_ms, 1000);
        assert_eq!(config.conflict_strategy, ConflictStrategy::NewerWins);
        assert_eq!(config.device_id.unwrap().as_str(), "laptop");
        assert!(!config.classification_rules.is_empty());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(
            SyncConfig::from_json(r#"{ "debounce_ms": "soon" }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_for_vault() {
        let dir = TempDir::new().unwrap();
        assert_eq!(SyncConfig::load_for_vault(dir.path()).unwrap(), SyncConfig::default());

        let meta = dir.path().join(META_DIRNAME);
        std::fs::create_dir_all(&meta).unwrap();
        let custom = SyncConfig {
            watch: false,
            scan_interval_secs: 0,
            ..SyncConfig::default()
        };
        std::fs::write(meta.join(CONFIG_FILENAME), custom.to_json().unwrap()).unwrap();

        let loaded = SyncConfig::load_for_vault(dir.path()).unwrap();
        assert!(!loaded.watch);
        assert!(loaded.scan_interval().is_zero());
    }

    #[test]
    fn test_bad_ignore_pattern_is_rejected() {
        let config = SyncConfig {
            ignore_patterns: vec!["[unclosed".to_string()],
            ..SyncConfig::default()
        };
        assert!(config.path_filter().is_err());
    }
}
