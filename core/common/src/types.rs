//! Common types used throughout vaultsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Stable identifier for the process or machine that produced a change.
///
/// Device ids are compared lexicographically when two versions tie on
/// modification time, so every device reaches the same verdict.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or contains whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "DeviceId cannot be empty".to_string(),
            ));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "DeviceId cannot contain whitespace: {:?}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random device id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` characters of the id, used in conflict file names.
    pub fn prefix(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A vault-relative, forward-slash normalized path.
///
/// `VaultPath` never carries a leading slash and never escapes the vault
/// root: `..` components are rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VaultPath {
    components: Vec<String>,
}

impl VaultPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, contains a separator
    ///   or is a relative component (`.` / `..`)
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            if comp.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot be empty".to_string(),
                ));
            }
            if comp.contains('/') || comp.contains('\\') {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot contain separators".to_string(),
                ));
            }
            if comp == "." || comp == ".." {
                return Err(crate::Error::InvalidInput(format!(
                    "Path component cannot be {:?}",
                    comp
                )));
            }
        }
        Ok(Self { components })
    }

    /// Parse a path string into a VaultPath.
    ///
    /// Backslashes are treated as separators, leading `/` and `./` are
    /// stripped and repeated separators collapse.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let normalized = path.replace('\\', "/");
        let components: Vec<String> = normalized
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Build a VaultPath from an absolute filesystem path under `root`.
    ///
    /// # Errors
    /// - Returns error if `path` is not inside `root` or is not valid UTF-8
    pub fn from_fs(root: &Path, path: &Path) -> crate::Result<Self> {
        let relative = path.strip_prefix(root).map_err(|_| {
            crate::Error::InvalidInput(format!(
                "{} is outside vault root {}",
                path.display(),
                root.display()
            ))
        })?;

        let mut components = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        crate::Error::InvalidInput(format!(
                            "Non UTF-8 path: {}",
                            path.display()
                        ))
                    })?;
                    components.push(part.to_string());
                }
                Component::CurDir => {}
                _ => {
                    return Err(crate::Error::InvalidInput(format!(
                        "Unsupported path component in {}",
                        path.display()
                    )))
                }
            }
        }
        Self::from_components(components)
    }

    /// Resolve this path against a vault root on disk.
    pub fn to_fs(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for comp in &self.components {
            path.push(comp);
        }
        path
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// File name without its final extension.
    pub fn file_stem(&self) -> Option<&str> {
        let name = self.name()?;
        match name.rfind('.') {
            Some(0) | None => Some(name),
            Some(dot) => Some(&name[..dot]),
        }
    }

    /// Final extension without the dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.name()?;
        match name.rfind('.') {
            Some(0) | None => None,
            Some(dot) => Some(&name[dot + 1..]),
        }
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        let mut components = self.components.clone();
        components.push(child.to_string());
        Self::from_components(components)
    }

    /// Replace the last component.
    pub fn with_name(&self, name: &str) -> crate::Result<Self> {
        match self.parent() {
            Some(parent) => parent.join(name),
            None => Err(crate::Error::InvalidInput(
                "Root path has no name".to_string(),
            )),
        }
    }

    /// Whether this path lies inside the directory prefix `dir`
    /// (e.g. `tasks/pending/` or `tasks/pending`).
    pub fn is_under(&self, dir: &str) -> bool {
        let Ok(dir) = Self::parse(dir) else {
            return false;
        };
        self.components.len() > dir.components.len()
            && self.components[..dir.components.len()] == dir.components[..]
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to the normalized string form (`a/b/c.md`).
    pub fn as_string(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl TryFrom<String> for VaultPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<VaultPath> for String {
    fn from(path: VaultPath) -> Self {
        path.as_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_creation() {
        let id = DeviceId::new("laptop-1").unwrap();
        assert_eq!(id.as_str(), "laptop-1");
    }

    #[test]
    fn test_device_id_empty_fails() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("has space").is_err());
    }

    #[test]
    fn test_device_id_prefix() {
        let id = DeviceId::new("abcdef0123456789").unwrap();
        assert_eq!(id.prefix(8), "abcdef01");
        assert_eq!(DeviceId::new("abc").unwrap().prefix(8), "abc");
    }

    #[test]
    fn test_generated_device_ids_differ() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }

    #[test]
    fn test_vault_path_parse_normalizes() {
        let path = VaultPath::parse("/tasks//pending\\t1.md").unwrap();
        assert_eq!(path.components(), &["tasks", "pending", "t1.md"]);
        assert_eq!(path.to_string(), "tasks/pending/t1.md");

        let dotted = VaultPath::parse("./notes/a.md").unwrap();
        assert_eq!(dotted.to_string(), "notes/a.md");
    }

    #[test]
    fn test_vault_path_rejects_parent_dir() {
        assert!(VaultPath::parse("notes/../../etc/passwd").is_err());
    }

    #[test]
    fn test_vault_path_from_fs() {
        let root = Path::new("/vault");
        let path = VaultPath::from_fs(root, Path::new("/vault/jobs/running/42.md")).unwrap();
        assert_eq!(path.to_string(), "jobs/running/42.md");
        assert!(VaultPath::from_fs(root, Path::new("/elsewhere/x.md")).is_err());
        assert_eq!(path.to_fs(root), PathBuf::from("/vault/jobs/running/42.md"));
    }

    #[test]
    fn test_vault_path_name_parts() {
        let path = VaultPath::parse("notes/daily.log.md").unwrap();
        assert_eq!(path.name(), Some("daily.log.md"));
        assert_eq!(path.file_stem(), Some("daily.log"));
        assert_eq!(path.extension(), Some("md"));

        let dotfile = VaultPath::parse(".env").unwrap();
        assert_eq!(dotfile.extension(), None);
        assert_eq!(dotfile.file_stem(), Some(".env"));
    }

    #[test]
    fn test_vault_path_is_under() {
        let path = VaultPath::parse("tasks/pending/t1.md").unwrap();
        assert!(path.is_under("tasks/pending/"));
        assert!(path.is_under("tasks"));
        assert!(!path.is_under("tasks/pend"));
        assert!(!path.is_under("tasks/pending/t1.md"));
    }

    #[test]
    fn test_vault_path_serde_as_string() {
        let path = VaultPath::parse("notes/a.md").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"notes/a.md\"");
        let back: VaultPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn test_vault_path_parent_and_with_name() {
        let path = VaultPath::parse("notes/a.md").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "notes");
        assert_eq!(path.with_name("b.md").unwrap().to_string(), "notes/b.md");
    }
}
