use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{IoContext, PatchError, Result};
use crate::util;

/// What was captured for a path before its action ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupEntry {
    /// A verbatim copy of the pre-apply state lives under the backup root.
    Copied,
    /// Nothing existed at the path; revert removes whatever the action wrote.
    Absent,
}

/// Pre-apply copies of every path touched by one transaction, mirrored under
/// `root` by relative path.
#[derive(Debug)]
pub struct BackupStore {
    root: PathBuf,
    entries: BTreeMap<String, BackupEntry>,
    /// Ancestor directories that did not exist before an action created them,
    /// outermost first.
    created_parents: BTreeMap<String, Vec<String>>,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BackupStore {
            root: root.into(),
            entries: BTreeMap::new(),
            created_parents: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root, refusing one that already holds another transaction's data.
    pub fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).at(&self.root)?;
        if util::has_children(&self.root)? {
            return Err(PatchError::BackupNotEmpty(self.root.clone()));
        }
        Ok(())
    }

    pub fn location(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Copy whatever is at `source` into the store under `path`.
    pub fn copy_in(&mut self, path: &str, source: &Path) -> Result<()> {
        let location = self.location(path);
        util::delete_path(&location)?;
        util::copy_path(source, &location)?;
        self.entries.insert(path.to_string(), BackupEntry::Copied);
        Ok(())
    }

    pub fn mark_absent(&mut self, path: &str) {
        self.entries.insert(path.to_string(), BackupEntry::Absent);
    }

    /// Record directories the action at `path` is about to create on its way down.
    pub fn mark_parents_absent(&mut self, path: &str, parents: Vec<String>) {
        if !parents.is_empty() {
            self.created_parents.insert(path.to_string(), parents);
        }
    }

    pub fn created_parents(&self, path: &str) -> &[String] {
        self.created_parents.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entry(&self, path: &str) -> Option<BackupEntry> {
        self.entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every captured copy and the root itself.
    pub fn discard(&mut self) -> Result<()> {
        util::delete_path(&self.root)?;
        self.entries.clear();
        self.created_parents.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_copy_in_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(target.join("docs")).unwrap();
        fs::write(target.join("docs/readme.txt"), b"v1").unwrap();

        let mut store = BackupStore::new(dir.path().join("backup"));
        store.prepare().unwrap();
        store.copy_in("docs/readme.txt", &target.join("docs/readme.txt")).unwrap();
        store.mark_absent("docs/new.txt");
        store.mark_parents_absent("fresh/deep/x.txt", vec!["fresh".into(), "fresh/deep".into()]);
        store.mark_parents_absent("docs/other.txt", Vec::new());

        assert_eq!(fs::read(store.location("docs/readme.txt")).unwrap(), b"v1");
        assert_eq!(store.entry("docs/readme.txt"), Some(BackupEntry::Copied));
        assert_eq!(store.entry("docs/new.txt"), Some(BackupEntry::Absent));
        assert_eq!(store.entry("other"), None);
        assert_eq!(store.created_parents("fresh/deep/x.txt"), ["fresh", "fresh/deep"]);
        assert!(store.created_parents("docs/other.txt").is_empty());

        store.discard().unwrap();
        assert!(!dir.path().join("backup").exists());
        assert!(store.is_empty());
        assert!(store.created_parents("fresh/deep/x.txt").is_empty());
    }

    #[test]
    fn test_prepare_rejects_used_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("leftover"), b"x").unwrap();
        let store = BackupStore::new(dir.path());
        assert!(matches!(store.prepare(), Err(PatchError::BackupNotEmpty(_))));
    }
}
