//! The three kinds of change a patch can carry and their
//! validate / backup / apply / revert / build operations.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backup::{BackupEntry, BackupStore};
use crate::delta;
use crate::digest::{self, Checksum};
use crate::error::{IoContext, PatchError, Result};
use crate::patch_format::{
    ActionKind, ActionRecord, ArchiveWriter, EntryKind, PatchArchive, PatchPolicy, Payload,
};
use crate::util;
use crate::validation::{
    conflict_options, error_options, Action, Kind, Resolution, ValidationResult,
    ABSENT_MESSAGE, ACCESS_DENIED_MESSAGE, ALREADY_EXISTS_MESSAGE, MODIFIED_MESSAGE,
    UNEXPECTED_MESSAGE,
};

/// Writes a new file or directory. `checksum` is of the new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAction {
    pub path: String,
    pub entry: EntryKind,
    pub checksum: Checksum,
}

/// Rewrites an existing file from `checksum_old` to `checksum_new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAction {
    pub path: String,
    pub checksum_old: Option<Checksum>,
    pub checksum_new: Checksum,
    pub delta: bool,
}

/// Removes a file or an empty directory. `checksum` is of the expected pre-state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAction {
    pub path: String,
    pub entry: EntryKind,
    pub checksum: Option<Checksum>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    Create(CreateAction),
    Update(UpdateAction),
    Delete(DeleteAction),
}

/// What an applied action actually did to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    CreatedDir,
    CreatedFile,
    Updated,
    DeletedFile,
    DeletedDir,
    /// A directory still holding entries the patch does not manage.
    Preserved,
}

impl PatchAction {
    pub fn create_dir(path: impl Into<String>) -> Self {
        PatchAction::Create(CreateAction {
            path: path.into(),
            entry: EntryKind::Dir,
            checksum: Checksum::DIRECTORY,
        })
    }

    pub fn create_file(path: impl Into<String>, checksum: Checksum) -> Self {
        PatchAction::Create(CreateAction {
            path: path.into(),
            entry: EntryKind::File,
            checksum,
        })
    }

    pub fn update(
        path: impl Into<String>,
        checksum_old: Option<Checksum>,
        checksum_new: Checksum,
        delta: bool,
    ) -> Self {
        PatchAction::Update(UpdateAction {
            path: path.into(),
            checksum_old,
            checksum_new,
            delta,
        })
    }

    pub fn delete_file(path: impl Into<String>, checksum: Option<Checksum>) -> Self {
        PatchAction::Delete(DeleteAction {
            path: path.into(),
            entry: EntryKind::File,
            checksum,
        })
    }

    pub fn delete_dir(path: impl Into<String>) -> Self {
        PatchAction::Delete(DeleteAction {
            path: path.into(),
            entry: EntryKind::Dir,
            checksum: Some(Checksum::DIRECTORY),
        })
    }

    pub fn path(&self) -> &str {
        match self {
            PatchAction::Create(a) => &a.path,
            PatchAction::Update(a) => &a.path,
            PatchAction::Delete(a) => &a.path,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            PatchAction::Create(_) => ActionKind::Create,
            PatchAction::Update(_) => ActionKind::Update,
            PatchAction::Delete(_) => ActionKind::Delete,
        }
    }

    pub fn entry(&self) -> EntryKind {
        match self {
            PatchAction::Create(a) => a.entry,
            PatchAction::Update(_) => EntryKind::File,
            PatchAction::Delete(a) => a.entry,
        }
    }

    /// Whether the archive must carry a payload entry for this action.
    pub fn needs_payload(&self) -> bool {
        match self {
            PatchAction::Create(a) => a.entry == EntryKind::File,
            PatchAction::Update(_) => true,
            PatchAction::Delete(_) => false,
        }
    }

    pub fn target(&self, target_dir: &Path) -> PathBuf {
        target_dir.join(self.path())
    }

    pub fn from_record(record: ActionRecord) -> Result<Self> {
        let path = util::normalize_path(&record.path)?;
        match (record.kind, record.entry) {
            (ActionKind::Create, EntryKind::Dir) => Ok(PatchAction::create_dir(path)),
            (ActionKind::Create, EntryKind::File) => {
                let checksum = record
                    .checksum_new
                    .ok_or_else(|| missing_checksum("create", &path))?;
                Ok(PatchAction::create_file(path, checksum))
            }
            (ActionKind::Update, EntryKind::File) => {
                let checksum_new = record
                    .checksum_new
                    .ok_or_else(|| missing_checksum("update", &path))?;
                Ok(PatchAction::update(path, record.checksum_old, checksum_new, record.delta))
            }
            (ActionKind::Update, EntryKind::Dir) => Err(PatchError::InvalidArchive(format!(
                "update of directory {path}"
            ))),
            (ActionKind::Delete, entry) => Ok(PatchAction::Delete(DeleteAction {
                path,
                entry,
                checksum: record.checksum_old,
            })),
        }
    }

    pub fn to_record(&self) -> ActionRecord {
        let (checksum_old, checksum_new, delta) = match self {
            PatchAction::Create(a) => (None, Some(a.checksum), false),
            PatchAction::Update(a) => (a.checksum_old, Some(a.checksum_new), a.delta),
            PatchAction::Delete(a) => (a.checksum, None, false),
        };
        ActionRecord {
            kind: self.kind(),
            entry: self.entry(),
            path: self.path().to_string(),
            checksum_old,
            checksum_new,
            delta,
        }
    }

    /// Check the live tree for anything that makes this action unsafe.
    ///
    /// Never touches the tree. I/O failures while inspecting a path are
    /// reported as access errors rather than returned.
    pub fn validate(&self, target_dir: &Path, policy: &PatchPolicy) -> Option<ValidationResult> {
        let file = self.target(target_dir);
        let strict = policy.is_strict_for(self.path());
        match self {
            PatchAction::Create(a) => a.validate(&file, strict),
            PatchAction::Update(a) => a.validate(&file, strict),
            PatchAction::Delete(a) => a.validate(&file, policy, strict),
        }
    }

    /// Whether apply has anything to do, given the caller's decision for this path.
    pub fn should_apply(&self, target_dir: &Path, decision: Option<Resolution>) -> bool {
        if decision.is_some_and(Resolution::skips_action) {
            return false;
        }
        let file = self.target(target_dir);
        match self {
            PatchAction::Create(a) if a.entry == EntryKind::Dir => !util::is_dir_nofollow(&file),
            PatchAction::Create(a) => !matches_checksum(&file, a.checksum),
            PatchAction::Update(a) => util::exists(&file) && !matches_checksum(&file, a.checksum_new),
            PatchAction::Delete(_) => util::exists(&file),
        }
    }

    /// Capture the pre-apply state of the target, or record that there was none.
    pub fn backup(&self, target_dir: &Path, store: &mut BackupStore) -> Result<()> {
        let file = self.target(target_dir);
        if let PatchAction::Create(_) = self {
            let parents = util::missing_ancestors(target_dir, self.path());
            store.mark_parents_absent(self.path(), parents);
        }
        if util::exists(&file) {
            debug!("Backup: {}", file.display());
            store.copy_in(self.path(), &file)
        } else {
            store.mark_absent(self.path());
            Ok(())
        }
    }

    pub fn apply(&self, target_dir: &Path, archive: &PatchArchive) -> Result<Applied> {
        let file = self.target(target_dir);
        match self {
            PatchAction::Create(a) => a.apply(&file, archive),
            PatchAction::Update(a) => a.apply(&file, archive),
            PatchAction::Delete(_) => apply_delete(&file),
        }
    }

    /// Put the target back to its backed-up state.
    ///
    /// Returns `false` when the store holds nothing for this path, meaning the
    /// action never ran.
    pub fn revert(&self, target_dir: &Path, store: &BackupStore) -> Result<bool> {
        let Some(entry) = store.entry(self.path()) else {
            return Ok(false);
        };
        let file = self.target(target_dir);
        let backup = store.location(self.path());

        let restore = match (self, entry) {
            (_, BackupEntry::Absent) => {
                info!("Revert: remove {}", file.display());
                util::delete_path(&file)?;
                false
            }
            (PatchAction::Delete(a), BackupEntry::Copied) => {
                !util::exists(&file)
                    || util::is_dir_nofollow(&file)
                    || digest::is_modified(&file, a.checksum).unwrap_or(true)
            }
            (_, BackupEntry::Copied) => {
                util::is_dir_nofollow(&file) || !same_content(&file, &backup)
            }
        };

        if restore {
            info!("Revert: restore {}", file.display());
            // A later create may have left a directory on this path.
            util::delete_path(&file)?;
            util::copy_path(&backup, &file)?;
        } else if entry == BackupEntry::Copied {
            debug!("Revert: {} already matches", file.display());
        }

        // Later actions inside these directories were reverted first.
        for parent in store.created_parents(self.path()).iter().rev() {
            let dir = target_dir.join(parent);
            info!("Revert: remove {}", dir.display());
            util::delete_path(&dir)?;
        }
        Ok(true)
    }

    /// Produce this action's archive payload from the authoring trees.
    pub fn build_payload(&self, old_dir: &Path, new_dir: &Path) -> Result<Option<Payload>> {
        match self {
            PatchAction::Create(a) if a.entry == EntryKind::File => {
                let source = new_dir.join(&a.path);
                let data = std::fs::read(&source).at(&source)?;
                Ok(Some(Payload::Full(data)))
            }
            PatchAction::Update(a) => {
                let new_data = util::mmap_file(&new_dir.join(&a.path))?;
                if a.delta {
                    let old_data = util::mmap_file(&old_dir.join(&a.path))?;
                    Ok(Some(Payload::Delta(delta::encode(&old_data, &new_data))))
                } else {
                    Ok(Some(Payload::Full(new_data.to_vec())))
                }
            }
            PatchAction::Create(_) | PatchAction::Delete(_) => Ok(None),
        }
    }

    pub fn build_into_archive(
        &self,
        old_dir: &Path,
        new_dir: &Path,
        writer: &mut ArchiveWriter,
    ) -> Result<()> {
        if let Some(payload) = self.build_payload(old_dir, new_dir)? {
            writer.put(self.path(), payload);
        }
        Ok(())
    }
}

impl CreateAction {
    fn validate(&self, file: &Path, strict: bool) -> Option<ValidationResult> {
        if let Some(result) = validate_access(file, &self.path, Action::Create, true, strict) {
            return Some(result);
        }
        if !util::exists(file) {
            return None;
        }
        match digest::digest(file) {
            Ok(found) if found == self.checksum => None,
            Ok(_) => Some(ValidationResult::new(
                Kind::Conflict,
                &self.path,
                Action::Create,
                ALREADY_EXISTS_MESSAGE,
                conflict_options(Resolution::Overwrite, strict),
            )),
            Err(_) => Some(access_denied(&self.path, Action::Create, strict)),
        }
    }

    fn apply(&self, file: &Path, archive: &PatchArchive) -> Result<Applied> {
        if self.entry == EntryKind::Dir {
            info!("Create directory: {}", file.display());
            if util::exists(file) && !util::is_dir_nofollow(file) {
                util::delete_path(file)?;
            }
            std::fs::create_dir_all(file).at(file)?;
            return Ok(Applied::CreatedDir);
        }

        let data = match archive.payload(&self.path) {
            Some(Payload::Full(data)) => data,
            Some(Payload::Delta(_)) => {
                return Err(PatchError::CorruptDelta {
                    path: self.path.clone(),
                    reason: "create cannot carry a delta".into(),
                })
            }
            None => return Err(PatchError::MissingPayload(self.path.clone())),
        };
        if Checksum::of_bytes(data) != self.checksum {
            return Err(PatchError::ChecksumMismatch(self.path.clone()));
        }

        info!("Create: {}", file.display());
        // Replace rather than write through whatever is there, links included.
        util::delete_path(file)?;
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        std::fs::write(file, data).at(file)?;
        Ok(Applied::CreatedFile)
    }
}

impl UpdateAction {
    fn validate(&self, file: &Path, strict: bool) -> Option<ValidationResult> {
        if let Some(result) = validate_access(file, &self.path, Action::Update, true, strict) {
            return Some(result);
        }
        if !util::exists(file) {
            return Some(ValidationResult::new(
                Kind::Error,
                &self.path,
                Action::Update,
                ABSENT_MESSAGE,
                error_options(strict),
            ));
        }
        let found = match digest::digest(file) {
            Ok(found) => found,
            Err(_) => return Some(access_denied(&self.path, Action::Update, strict)),
        };
        if Some(found) == self.checksum_old || found == self.checksum_new {
            return None;
        }
        // A delta only reproduces the new content from the exact old bytes.
        let options = match (self.delta, strict) {
            (true, true) => vec![Resolution::Abort],
            (true, false) => vec![Resolution::Keep],
            (false, strict) => conflict_options(Resolution::Overwrite, strict),
        };
        Some(ValidationResult::new(
            Kind::Conflict,
            &self.path,
            Action::Update,
            MODIFIED_MESSAGE,
            options,
        ))
    }

    fn apply(&self, file: &Path, archive: &PatchArchive) -> Result<Applied> {
        let payload = archive
            .payload(&self.path)
            .ok_or_else(|| PatchError::MissingPayload(self.path.clone()))?;

        // The mapping is dropped before the file is replaced.
        let new_data: Cow<'_, [u8]> = match payload {
            Payload::Full(data) => Cow::Borrowed(data.as_slice()),
            Payload::Delta(ops) => {
                let base = util::mmap_file(file)?;
                let rebuilt = delta::decode(&base, ops).map_err(|e| PatchError::CorruptDelta {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })?;
                Cow::Owned(rebuilt)
            }
        };

        if Checksum::of_bytes(&new_data) != self.checksum_new {
            return Err(PatchError::ChecksumMismatch(self.path.clone()));
        }

        info!("Update: {}", file.display());
        util::delete_path(file)?;
        std::fs::write(file, &new_data).at(file)?;
        Ok(Applied::Updated)
    }
}

impl DeleteAction {
    fn validate(
        &self,
        file: &Path,
        policy: &PatchPolicy,
        strict: bool,
    ) -> Option<ValidationResult> {
        if let Some(result) = validate_access(file, &self.path, Action::Delete, false, strict) {
            return Some(result);
        }
        if !policy.validates_deletion_of(&self.path) || !util::exists(file) {
            return None;
        }
        match digest::is_modified(file, self.checksum) {
            Ok(false) => None,
            Ok(true) => {
                let (action, message) = if self.checksum.is_none() {
                    (Action::Validate, UNEXPECTED_MESSAGE)
                } else {
                    (Action::Delete, MODIFIED_MESSAGE)
                };
                Some(ValidationResult::new(
                    Kind::Conflict,
                    &self.path,
                    action,
                    message,
                    conflict_options(Resolution::Delete, strict),
                ))
            }
            Err(_) => Some(access_denied(&self.path, Action::Delete, strict)),
        }
    }
}

fn apply_delete(file: &Path) -> Result<Applied> {
    info!("Delete action. File: {}", file.display());

    // A directory can be deleted only when it holds no user content.
    let is_dir = util::is_dir_nofollow(file);
    let can_delete = !is_dir || !util::has_children(file)?;

    if can_delete {
        info!("Delete: {}", file.display());
        util::delete_path(file)?;
        Ok(if is_dir { Applied::DeletedDir } else { Applied::DeletedFile })
    } else {
        warn!("Preserved: {}", file.display());
        Ok(Applied::Preserved)
    }
}

/// Existence and permission checks shared by every action kind.
fn validate_access(
    file: &Path,
    path: &str,
    action: Action,
    check_writable: bool,
    strict: bool,
) -> Option<ValidationResult> {
    let meta = match std::fs::symlink_metadata(file) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(_) => return Some(access_denied(path, action, strict)),
    };
    if meta.is_dir() || !check_writable || !meta.permissions().readonly() {
        return None;
    }
    Some(access_denied(path, action, strict))
}

fn access_denied(path: &str, action: Action, strict: bool) -> ValidationResult {
    ValidationResult::new(
        Kind::Error,
        path,
        action,
        ACCESS_DENIED_MESSAGE,
        error_options(strict),
    )
}

fn missing_checksum(what: &str, path: &str) -> PatchError {
    PatchError::InvalidArchive(format!("{what} of {path} has no new checksum"))
}

fn matches_checksum(file: &Path, expected: Checksum) -> bool {
    matches!(digest::digest(file), Ok(found) if found == expected)
}

fn same_content(a: &Path, b: &Path) -> bool {
    match (digest::digest(a), digest::digest(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::{PatchHeader, PatchMeta, FORMAT_VERSION};
    use std::fs;

    fn policy(strict: bool) -> PatchPolicy {
        PatchPolicy {
            strict,
            ..PatchPolicy::default()
        }
    }

    fn empty_archive() -> PatchArchive {
        archive_with(ArchiveWriter::new())
    }

    fn archive_with(writer: ArchiveWriter) -> PatchArchive {
        let header = PatchHeader {
            version: FORMAT_VERSION,
            meta: PatchMeta::default(),
            policy: PatchPolicy::default(),
            actions: Vec::new(),
        };
        PatchArchive::from_parts(header, writer)
    }

    #[test]
    fn test_delete_modified_file_conflict() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/readme.txt"), b"C2 content").unwrap();
        let action = PatchAction::delete_file("docs/readme.txt", Some(Checksum::of_bytes(b"C1")));

        let result = action.validate(dir.path(), &policy(false)).unwrap();
        assert_eq!(result.kind, Kind::Conflict);
        assert_eq!(result.action, Action::Delete);
        assert_eq!(result.message, "Modified");
        assert_eq!(result.options, vec![Resolution::Delete, Resolution::Keep]);

        let strict = action.validate(dir.path(), &policy(true)).unwrap();
        assert_eq!(strict.options, vec![Resolution::Delete]);
    }

    #[test]
    fn test_delete_unrecorded_checksum_is_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stray.log"), b"anything").unwrap();
        let action = PatchAction::delete_file("stray.log", None);

        let result = action.validate(dir.path(), &policy(false)).unwrap();
        assert_eq!(result.action, Action::Validate);
        assert_eq!(result.message, "Unexpected file");

        let unchecked = PatchPolicy {
            validate_deletion: false,
            ..PatchPolicy::default()
        };
        assert!(action.validate(dir.path(), &unchecked).is_none());
    }

    #[test]
    fn test_delete_pristine_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"pristine").unwrap();
        let action = PatchAction::delete_file("a.txt", Some(Checksum::of_bytes(b"pristine")));
        assert!(action.validate(dir.path(), &policy(true)).is_none());

        let gone = PatchAction::delete_file("gone.txt", Some(Checksum::of_bytes(b"x")));
        assert!(gone.validate(dir.path(), &policy(true)).is_none());
        assert!(!gone.should_apply(dir.path(), None));
    }

    #[test]
    fn test_delete_keeps_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/leftover.o"), b"user data").unwrap();
        let action = PatchAction::delete_dir("build");

        assert!(action.should_apply(dir.path(), None));
        let applied = action.apply(dir.path(), &empty_archive()).unwrap();
        assert_eq!(applied, Applied::Preserved);
        assert_eq!(fs::read(dir.path().join("build/leftover.o")).unwrap(), b"user data");

        fs::remove_file(dir.path().join("build/leftover.o")).unwrap();
        assert_eq!(action.apply(dir.path(), &empty_archive()).unwrap(), Applied::DeletedDir);
        assert!(!dir.path().join("build").exists());
    }

    #[test]
    fn test_delete_backup_and_revert_restores_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(target.join("docs")).unwrap();
        fs::write(target.join("docs/readme.txt"), b"C2 content").unwrap();
        let action = PatchAction::delete_file("docs/readme.txt", Some(Checksum::of_bytes(b"C1")));
        let mut store = BackupStore::new(dir.path().join("backup"));

        action.backup(&target, &mut store).unwrap();
        action.apply(&target, &empty_archive()).unwrap();
        assert!(!target.join("docs/readme.txt").exists());

        assert!(action.revert(&target, &store).unwrap());
        assert_eq!(fs::read(target.join("docs/readme.txt")).unwrap(), b"C2 content");
    }

    #[test]
    fn test_delete_revert_replaces_directory_left_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("x"), b"file").unwrap();
        let action = PatchAction::delete_file("x", Some(Checksum::of_bytes(b"file")));
        let mut store = BackupStore::new(dir.path().join("backup"));

        action.backup(&target, &mut store).unwrap();
        action.apply(&target, &empty_archive()).unwrap();
        fs::create_dir_all(target.join("x/inner")).unwrap();

        action.revert(&target, &store).unwrap();
        assert_eq!(fs::read(target.join("x")).unwrap(), b"file");
    }

    #[test]
    fn test_revert_without_backup_entry_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("backup"));
        let action = PatchAction::delete_file("never.txt", None);
        assert!(!action.revert(dir.path(), &store).unwrap());
    }

    #[test]
    fn test_create_conflicts_only_on_different_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("same.txt"), b"new").unwrap();
        fs::write(dir.path().join("other.txt"), b"local").unwrap();

        let same = PatchAction::create_file("same.txt", Checksum::of_bytes(b"new"));
        assert!(same.validate(dir.path(), &policy(false)).is_none());
        assert!(!same.should_apply(dir.path(), None));

        let other = PatchAction::create_file("other.txt", Checksum::of_bytes(b"new"));
        let result = other.validate(dir.path(), &policy(false)).unwrap();
        assert_eq!(result.message, "Already exists");
        assert_eq!(result.options, vec![Resolution::Overwrite, Resolution::Keep]);
        assert!(!other.should_apply(dir.path(), Some(Resolution::Keep)));
        assert!(other.should_apply(dir.path(), Some(Resolution::Overwrite)));
    }

    #[test]
    fn test_create_apply_and_revert_removes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let mut writer = ArchiveWriter::new();
        writer.put("lib/new.so", Payload::Full(b"binary".to_vec()));
        let archive = archive_with(writer);
        let action = PatchAction::create_file("lib/new.so", Checksum::of_bytes(b"binary"));
        let mut store = BackupStore::new(dir.path().join("backup"));

        action.backup(&target, &mut store).unwrap();
        assert_eq!(store.entry("lib/new.so"), Some(BackupEntry::Absent));
        assert_eq!(store.created_parents("lib/new.so"), ["lib"]);
        assert_eq!(action.apply(&target, &archive).unwrap(), Applied::CreatedFile);
        assert_eq!(fs::read(target.join("lib/new.so")).unwrap(), b"binary");

        action.revert(&target, &store).unwrap();
        assert!(!target.join("lib").exists());
        assert!(target.exists());
    }

    #[test]
    fn test_create_rejects_tampered_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::new();
        writer.put("a.txt", Payload::Full(b"tampered".to_vec()));
        let action = PatchAction::create_file("a.txt", Checksum::of_bytes(b"original"));
        assert!(matches!(
            action.apply(dir.path(), &archive_with(writer)),
            Err(PatchError::ChecksumMismatch(_))
        ));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_update_with_delta_payload() {
        let dir = tempfile::tempdir().unwrap();
        let old: Vec<u8> = (0..3 * delta::BLOCK_SIZE).map(|i| (i % 199) as u8).collect();
        let mut new = old.clone();
        new.extend_from_slice(b"appended tail");
        fs::write(dir.path().join("data.bin"), &old).unwrap();

        let mut writer = ArchiveWriter::new();
        writer.put("data.bin", Payload::Delta(delta::encode(&old, &new)));
        let action = PatchAction::update(
            "data.bin",
            Some(Checksum::of_bytes(&old)),
            Checksum::of_bytes(&new),
            true,
        );

        assert!(action.validate(dir.path(), &policy(true)).is_none());
        assert_eq!(action.apply(dir.path(), &archive_with(writer)).unwrap(), Applied::Updated);
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), new);
        assert!(!action.should_apply(dir.path(), None));
    }

    #[test]
    fn test_update_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cfg.ini"), b"locally edited").unwrap();
        let full = PatchAction::update(
            "cfg.ini",
            Some(Checksum::of_bytes(b"v1")),
            Checksum::of_bytes(b"v2"),
            false,
        );
        let result = full.validate(dir.path(), &policy(false)).unwrap();
        assert_eq!(result.options, vec![Resolution::Overwrite, Resolution::Keep]);

        let delta = PatchAction::update(
            "cfg.ini",
            Some(Checksum::of_bytes(b"v1")),
            Checksum::of_bytes(b"v2"),
            true,
        );
        assert_eq!(
            delta.validate(dir.path(), &policy(false)).unwrap().options,
            vec![Resolution::Keep]
        );
        assert_eq!(
            delta.validate(dir.path(), &policy(true)).unwrap().options,
            vec![Resolution::Abort]
        );

        let absent = PatchAction::update("missing.ini", None, Checksum::of_bytes(b"v2"), false);
        let result = absent.validate(dir.path(), &policy(false)).unwrap();
        assert_eq!(result.kind, Kind::Error);
        assert_eq!(result.message, "Absent");
        assert_eq!(result.options, vec![Resolution::Ignore]);
    }

    #[test]
    fn test_readonly_target_is_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("locked.dat");
        fs::write(&file, b"v1").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();

        let action = PatchAction::update(
            "locked.dat",
            Some(Checksum::of_bytes(b"v1")),
            Checksum::of_bytes(b"v2"),
            false,
        );
        let result = action.validate(dir.path(), &policy(true)).unwrap();
        assert_eq!(result.kind, Kind::Error);
        assert_eq!(result.message, "Access denied");
        assert_eq!(result.options, vec![Resolution::Abort]);

        // Deletion does not require the file itself to be writable.
        let delete = PatchAction::delete_file("locked.dat", Some(Checksum::of_bytes(b"v1")));
        assert!(delete.validate(dir.path(), &policy(true)).is_none());
    }

    #[test]
    fn test_record_conversion_keeps_fields() {
        let action = PatchAction::update("a/b", None, Checksum::of_bytes(b"n"), true);
        assert_eq!(PatchAction::from_record(action.to_record()).unwrap(), action);

        let mut bad = PatchAction::create_file("../escape", Checksum::of_bytes(b"x")).to_record();
        assert!(matches!(PatchAction::from_record(bad.clone()), Err(PatchError::InvalidPath(_))));
        bad.path = "ok".into();
        bad.checksum_new = None;
        assert!(matches!(PatchAction::from_record(bad), Err(PatchError::InvalidArchive(_))));
    }

    #[test]
    fn test_build_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let (old, new) = (dir.path().join("old"), dir.path().join("new"));
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&new).unwrap();
        fs::write(new.join("added.txt"), b"hello").unwrap();

        let mut writer = ArchiveWriter::new();
        PatchAction::create_file("added.txt", Checksum::of_bytes(b"hello"))
            .build_into_archive(&old, &new, &mut writer)
            .unwrap();
        PatchAction::delete_file("removed.txt", None)
            .build_into_archive(&old, &new, &mut writer)
            .unwrap();
        PatchAction::create_dir("sub")
            .build_into_archive(&old, &new, &mut writer)
            .unwrap();
        assert_eq!(writer.len(), 1);
    }
}
