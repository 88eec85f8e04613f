use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

use crate::error::{IoContext, Result};

/// Content fingerprint of a file, directory or symlink.
///
/// A checksum that was never recorded is modelled as `Option<Checksum>::None`
/// by the callers, not as a reserved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    /// Every directory fingerprints to this value regardless of its contents.
    pub const DIRECTORY: Checksum = Checksum([0; 32]);

    pub fn of_bytes(data: &[u8]) -> Self {
        Checksum(*blake3::hash(data).as_bytes())
    }

    pub fn is_directory(&self) -> bool {
        *self == Self::DIRECTORY
    }
}

impl From<blake3::Hash> for Checksum {
    fn from(hash: blake3::Hash) -> Self {
        Checksum(*hash.as_bytes())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_directory() {
            return f.write_str("<dir>");
        }
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

const LINK_DOMAIN: &[u8] = b"treepatch:symlink:";

/// Fingerprint whatever occupies `path`.
///
/// Files hash their bytes, directories map to [`Checksum::DIRECTORY`], and
/// symlinks hash their target string so the result never depends on what the
/// link points at. Timestamps and permissions are ignored.
pub fn digest(path: &Path) -> Result<Checksum> {
    let meta = std::fs::symlink_metadata(path).at(path)?;
    let file_type = meta.file_type();
    if file_type.is_dir() {
        return Ok(Checksum::DIRECTORY);
    }
    if file_type.is_symlink() {
        let target = std::fs::read_link(path).at(path)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(LINK_DOMAIN);
        hasher.update(target.to_string_lossy().replace('\\', "/").as_bytes());
        return Ok(hasher.finalize().into());
    }
    digest_file(path)
}

/// Stream-hash a regular file through a 256 KB buffer.
pub fn digest_file(path: &Path) -> Result<Checksum> {
    let file = std::fs::File::open(path).at(path)?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// True when `path` no longer matches `expected`.
///
/// An unrecorded checksum always counts as modified.
pub fn is_modified(path: &Path, expected: Option<Checksum>) -> Result<bool> {
    match expected {
        None => Ok(true),
        Some(expected) => Ok(digest(path)? != expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_file_digest_is_content_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("nested_b.bin");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        assert_eq!(digest(&a).unwrap(), digest(&b).unwrap());
        assert_eq!(digest(&a).unwrap(), Checksum::of_bytes(b"same bytes"));
    }

    #[test]
    fn test_directory_digest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("child"), b"x").unwrap();
        assert_eq!(digest(dir.path()).unwrap(), Checksum::DIRECTORY);
    }

    #[test]
    fn test_unrecorded_checksum_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        fs::write(&f, b"content").unwrap();
        assert!(is_modified(&f, None).unwrap());
        assert!(!is_modified(&f, Some(Checksum::of_bytes(b"content"))).unwrap());
        assert!(is_modified(&f, Some(Checksum::of_bytes(b"other"))).unwrap());
    }

    #[test]
    fn test_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(digest(&dir.path().join("nope")).is_err());
    }
}
