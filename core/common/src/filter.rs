//! Ignore-pattern and document-type filtering.
//!
//! Both the watcher and the scanner run every candidate path through the
//! same [`PathFilter`], so the two detectors always agree on what is tracked.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::{Error, Result, VaultPath};

/// Glob patterns excluded when no configuration overrides them.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git/**",
    ".obsidian/**",
    ".vaultsync/**",
    ".trash/**",
    "**/.DS_Store",
    "**/*.tmp",
    "**/*.swp",
    "**/*~",
    // conflict copies are never tracked
    "**/*.sync-conflict-*",
];

/// Extensions of the vault's structured documents.
pub const DEFAULT_DOCUMENT_EXTENSIONS: &[&str] = &["md"];

/// Decides whether a vault path is a tracked document.
#[derive(Debug, Clone)]
pub struct PathFilter {
    ignore: GlobSet,
    extensions: Vec<String>,
}

impl PathFilter {
    /// Build a filter from glob patterns and document extensions.
    ///
    /// Patterns are matched against the vault-relative path; `*` does not
    /// cross a `/`, `**` does.
    pub fn new<P, E>(ignore_patterns: P, extensions: E) -> Result<Self>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_patterns {
            let glob = GlobBuilder::new(pattern.as_ref())
                .literal_separator(true)
                .build()
                .map_err(|e| Error::Config(format!("bad ignore pattern: {}", e)))?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| Error::Config(format!("bad ignore pattern set: {}", e)))?;

        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();

        Ok(Self { ignore, extensions })
    }

    /// Whether the path is excluded by an ignore pattern.
    pub fn is_ignored(&self, path: &VaultPath) -> bool {
        self.ignore.is_match(path.as_string())
    }

    /// Whether a directory (and so everything below it) is excluded.
    ///
    /// Used to prune the full-scan walk.
    pub fn is_ignored_dir(&self, dir: &VaultPath) -> bool {
        if dir.is_root() {
            return false;
        }
        let dir = dir.as_string();
        self.ignore.is_match(&dir) || self.ignore.is_match(format!("{}/", dir))
    }

    /// Whether the path has one of the tracked document extensions.
    pub fn is_document(&self, path: &VaultPath) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    /// Whether the path is a tracked, non-ignored document.
    pub fn accepts(&self, path: &VaultPath) -> bool {
        self.is_document(path) && !self.is_ignored(path)
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        match Self::new(DEFAULT_IGNORE_PATTERNS, DEFAULT_DOCUMENT_EXTENSIONS) {
            Ok(filter) => filter,
            Err(_) => unreachable!("built-in ignore patterns are valid globs"),
        }
    }
}
