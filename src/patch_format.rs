//! On-disk patch archive.
//!
//! ```text
//! MAGIC (8) | version, u32 LE | header length, u64 LE | zstd(bincode(PatchHeader)) | zstd(bincode(payload map))
//! ```
//!
//! The version sits outside the compressed header so a reader can refuse a
//! layout it does not know before decoding anything. The header is decoded
//! before the payloads so a patch can be inspected or validated without
//! inflating them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::delta::DeltaOp;
use crate::digest::Checksum;
use crate::error::{IoContext, PatchError, Result};
use crate::util;

pub const MAGIC: &[u8; 8] = b"TPATCH01";
pub const FORMAT_VERSION: u32 = 1;
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

/// One action as stored in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub entry: EntryKind,
    pub path: String,
    pub checksum_old: Option<Checksum>,
    pub checksum_new: Option<Checksum>,
    /// Update payload is a delta against the old content rather than full bytes.
    pub delta: bool,
}

/// Patch-wide apply policy, fixed when the patch is authored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPolicy {
    /// Conflicts must be resolved by following the patch; KEEP and IGNORE are never offered.
    pub strict: bool,
    /// Whether deletion targets are checked against their recorded checksum at all.
    pub validate_deletion: bool,
    /// Prefixes whose conflicts are narrowed as if the patch were strict.
    pub critical: Vec<String>,
    /// Prefixes deleted without content validation.
    pub force_delete: Vec<String>,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        PatchPolicy {
            strict: false,
            validate_deletion: true,
            critical: Vec::new(),
            force_delete: Vec::new(),
        }
    }
}

impl PatchPolicy {
    pub fn is_strict_for(&self, path: &str) -> bool {
        self.strict || self.critical.iter().any(|p| util::is_under(path, p))
    }

    pub fn validates_deletion_of(&self, path: &str) -> bool {
        self.validate_deletion && !self.force_delete.iter().any(|p| util::is_under(path, p))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMeta {
    pub old_version: Option<String>,
    pub new_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub version: u32,
    pub meta: PatchMeta,
    pub policy: PatchPolicy,
    pub actions: Vec<ActionRecord>,
}

/// New content for a Create or Update, addressed by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Full(Vec<u8>),
    Delta(Vec<DeltaOp>),
}

impl Payload {
    pub fn is_delta(&self) -> bool {
        matches!(self, Payload::Delta(_))
    }
}

/// Accumulates payload entries while a patch is being authored.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    payloads: BTreeMap<String, Payload>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, path: &str, payload: Payload) {
        self.payloads.insert(path.to_string(), payload);
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Serialize, compress and write the archive.
    pub fn finish(self, header: &PatchHeader, output: &Path) -> Result<()> {
        let header_bytes = compress(&bincode::serialize(header)?, output)?;
        let payload_bytes = compress(&bincode::serialize(&self.payloads)?, output)?;

        let mut file = std::fs::File::create(output).at(output)?;
        file.write_all(MAGIC).at(output)?;
        file.write_all(&header.version.to_le_bytes()).at(output)?;
        file.write_all(&(header_bytes.len() as u64).to_le_bytes()).at(output)?;
        file.write_all(&header_bytes).at(output)?;
        file.write_all(&payload_bytes).at(output)?;
        file.flush().at(output)?;
        Ok(())
    }
}

fn compress(data: &[u8], output: &Path) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, COMPRESSION_LEVEL).at(output)
}

/// A patch archive opened for reading.
pub struct PatchArchive {
    pub header: PatchHeader,
    payloads: BTreeMap<String, Payload>,
}

impl PatchArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let raw = util::mmap_file(path)?;
        let (header, payload_section) = split_sections(&raw)?;

        let decoder = zstd::Decoder::new(payload_section).at(path)?;
        let payloads: BTreeMap<String, Payload> = bincode::deserialize_from(decoder)?;

        Ok(PatchArchive { header, payloads })
    }

    /// Read only the header, leaving payloads compressed on disk.
    pub fn read_header(path: &Path) -> Result<PatchHeader> {
        let raw = util::mmap_file(path)?;
        Ok(split_sections(&raw)?.0)
    }

    pub fn payload(&self, path: &str) -> Option<&Payload> {
        self.payloads.get(path)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(header: PatchHeader, writer: ArchiveWriter) -> Self {
        PatchArchive {
            header,
            payloads: writer.payloads,
        }
    }
}

fn split_sections(raw: &[u8]) -> Result<(PatchHeader, &[u8])> {
    let version_end = MAGIC.len() + 4;
    let prefix = version_end + 8;
    if raw.len() < prefix || &raw[..MAGIC.len()] != MAGIC {
        return Err(PatchError::InvalidArchive("missing magic header".into()));
    }
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&raw[MAGIC.len()..version_end]);
    let version = u32::from_le_bytes(version_bytes);
    if version != FORMAT_VERSION {
        return Err(PatchError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&raw[version_end..prefix]);
    let header_len = u64::from_le_bytes(len_bytes);
    let header_end = usize::try_from(header_len)
        .ok()
        .and_then(|len| prefix.checked_add(len))
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| PatchError::InvalidArchive("header length out of range".into()))?;

    let decoder = zstd::Decoder::new(&raw[prefix..header_end])
        .map_err(|e| PatchError::InvalidArchive(e.to_string()))?;
    let header: PatchHeader = bincode::deserialize_from(decoder)?;

    if header.version != version {
        return Err(PatchError::InvalidArchive(format!(
            "header claims version {} inside a version {} archive",
            header.version, version
        )));
    }
    Ok((header, &raw[header_end..]))
}
