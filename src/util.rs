use memmap2::Mmap;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{IoContext, PatchError, Result};
use crate::patch_format::EntryKind;

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories). Free from the OS directory scan.
    pub size: u64,
    pub symlink: bool,
}

/// Walk a directory tree and collect all entries with relative paths.
/// Paths use forward slashes for cross-platform consistency in the patch format.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let root = root.canonicalize().at(root)?;

    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            PatchError::Io {
                path,
                source: e.into(),
            }
        })?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .map_err(|_| PatchError::InvalidPath(full_path.display().to_string()))?;

        let relative_str = relative
            .to_str()
            .ok_or_else(|| PatchError::InvalidPath(relative.display().to_string()))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let meta = entry.metadata().map_err(|e| PatchError::Io {
            path: full_path.clone(),
            source: e.into(),
        })?;
        let size = if kind == EntryKind::File { meta.len() } else { 0 };

        entries.push(DirEntry {
            relative_path: relative_str,
            kind,
            full_path,
            size,
            symlink: entry.path_is_symlink(),
        });
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path).at(path)?;
    // SAFETY: read-only mapping; the transaction owns the target tree exclusively.
    unsafe { Mmap::map(&file).at(path) }
}

/// Normalize a patch path to forward slashes and reject anything that could
/// escape the target root.
pub fn normalize_path(raw: &str) -> Result<String> {
    let unified = raw.replace('\\', "/");
    let trimmed = unified.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        return Err(PatchError::InvalidPath(raw.to_string()));
    }
    for component in Path::new(trimmed).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(PatchError::InvalidPath(raw.to_string()));
        }
    }
    if trimmed
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(PatchError::InvalidPath(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

/// True when `path` equals `prefix` or lies underneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// Existence check that does not follow symlinks, so dangling links count.
pub fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

pub fn is_dir_nofollow(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

/// Ancestors of `path` missing under `root`, outermost first.
pub fn missing_ancestors(root: &Path, path: &str) -> Vec<String> {
    let mut missing = Vec::new();
    let mut end = 0;
    while let Some(pos) = path[end..].find('/') {
        end += pos;
        let ancestor = &path[..end];
        if !missing.is_empty() || !exists(&root.join(ancestor)) {
            missing.push(ancestor.to_string());
        }
        end += 1;
    }
    missing
}

/// True when the directory has at least one direct child.
pub fn has_children(dir: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(dir).at(dir)?;
    Ok(entries.next().is_some())
}

/// Copy a file, symlink or whole directory tree to `dst`, creating parents.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(src).at(src)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    let file_type = meta.file_type();
    if file_type.is_dir() {
        std::fs::create_dir_all(dst).at(dst)?;
        let mut children: Vec<_> = std::fs::read_dir(src)
            .at(src)?
            .collect::<std::io::Result<_>>()
            .at(src)?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            copy_path(&child.path(), &dst.join(child.file_name()))?;
        }
        return Ok(());
    }
    if file_type.is_symlink() {
        return copy_symlink(src, dst);
    }
    std::fs::copy(src, dst).at(dst)?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src).at(src)?;
    std::os::unix::fs::symlink(&target, dst).at(dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst).at(dst)?;
    Ok(())
}

/// Remove whatever occupies `path`. A missing path is not an error.
pub fn delete_path(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PatchError::Io { path: path.to_path_buf(), source: e }),
    };
    if meta.file_type().is_dir() {
        std::fs::remove_dir_all(path).at(path)
    } else {
        std::fs::remove_file(path).at(path)
    }
}

/// Collect just the relative paths as a set for fast lookup.
pub fn path_set(entries: &[DirEntry]) -> BTreeSet<String> {
    entries.iter().map(|e| e.relative_path.clone()).collect()
}

/// Sort directory paths so parents come before children.
pub fn sort_dirs_parent_first(dirs: &mut [String]) {
    dirs.sort();
}

/// Sort directory paths so children come before parents (for deletion).
pub fn sort_dirs_deepest_first(dirs: &mut [String]) {
    dirs.sort();
    dirs.reverse();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("dir/").unwrap(), "dir");
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("./a").is_err());
        assert!(normalize_path("a//b").is_err());
        assert!(normalize_path("a/./b").is_err());
    }

    #[test]
    fn test_missing_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        assert_eq!(missing_ancestors(dir.path(), "a/b/c/x.txt"), vec!["a/b", "a/b/c"]);
        assert!(missing_ancestors(dir.path(), "a/x.txt").is_empty());
        assert!(missing_ancestors(dir.path(), "top.txt").is_empty());
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("build/out.o", "build"));
        assert!(is_under("build", "build/"));
        assert!(!is_under("buildx/out.o", "build"));
        assert!(!is_under("bui", "build"));
    }

    #[test]
    fn test_copy_and_delete_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("sub/empty")).unwrap();
        fs::write(src.join("sub/f.txt"), b"payload").unwrap();

        let dst = dir.path().join("backup/nested/dst");
        copy_path(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("sub/f.txt")).unwrap(), b"payload");
        assert!(dst.join("sub/empty").is_dir());

        delete_path(&dst).unwrap();
        assert!(!exists(&dst));
        delete_path(&dst).unwrap();
    }

    #[test]
    fn test_walk_directory_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), b"123").unwrap();
        let entries = walk_directory(dir.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c.txt"]);
        assert_eq!(entries[2].size, 3);
        assert_eq!(entries[0].kind, EntryKind::Dir);
    }
}
