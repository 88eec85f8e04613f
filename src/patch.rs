use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, error, info};

use crate::action::{Applied, PatchAction};
use crate::backup::BackupStore;
use crate::error::{PatchError, Result};
use crate::patch_format::{
    ActionKind, EntryKind, PatchArchive, PatchHeader, PatchMeta, PatchPolicy, FORMAT_VERSION,
};
use crate::runner::CancelToken;
use crate::util;
use crate::validation::{Resolution, ValidationResult};

/// Counts of each action kind in a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
}

/// What one apply pass did to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub dirs_created: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub dirs_deleted: usize,
    pub preserved: usize,
    pub skipped: usize,
}

impl ApplySummary {
    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::CreatedDir => self.dirs_created += 1,
            Applied::CreatedFile => self.files_added += 1,
            Applied::Updated => self.files_modified += 1,
            Applied::DeletedFile => self.files_deleted += 1,
            Applied::DeletedDir => self.dirs_deleted += 1,
            Applied::Preserved => self.preserved += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevertSummary {
    pub reverted: usize,
    pub failed: usize,
}

/// An ordered, immutable list of actions plus the policy they run under.
///
/// Insertion order is apply order; revert walks the same list backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub meta: PatchMeta,
    pub policy: PatchPolicy,
    actions: Vec<PatchAction>,
}

impl Patch {
    /// Build a patch, checking path uniqueness and delete ordering.
    pub fn new(meta: PatchMeta, policy: PatchPolicy, actions: Vec<PatchAction>) -> Result<Self> {
        check_actions(&actions)?;
        Ok(Patch {
            meta,
            policy,
            actions,
        })
    }

    pub fn from_header(header: PatchHeader) -> Result<Self> {
        let actions = header
            .actions
            .into_iter()
            .map(PatchAction::from_record)
            .collect::<Result<Vec<_>>>()?;
        Patch::new(header.meta, header.policy, actions)
    }

    pub fn to_header(&self) -> PatchHeader {
        PatchHeader {
            version: FORMAT_VERSION,
            meta: self.meta.clone(),
            policy: self.policy.clone(),
            actions: self.actions.iter().map(PatchAction::to_record).collect(),
        }
    }

    pub fn actions(&self) -> &[PatchAction] {
        &self.actions
    }

    pub fn stats(&self) -> PatchStats {
        let mut stats = PatchStats::default();
        for action in &self.actions {
            match (action.kind(), action.entry()) {
                (ActionKind::Create, EntryKind::Dir) => stats.dirs_created += 1,
                (ActionKind::Create, EntryKind::File) => stats.files_added += 1,
                (ActionKind::Update, _) => stats.files_modified += 1,
                (ActionKind::Delete, EntryKind::File) => stats.files_deleted += 1,
                (ActionKind::Delete, EntryKind::Dir) => stats.dirs_deleted += 1,
            }
        }
        stats
    }

    /// Fail early if an archive lacks a payload some action will need, or
    /// carries one of the wrong form.
    pub fn check_payloads(&self, archive: &PatchArchive) -> Result<()> {
        for action in self.actions.iter().filter(|a| a.needs_payload()) {
            let payload = archive
                .payload(action.path())
                .ok_or_else(|| PatchError::MissingPayload(action.path().to_string()))?;
            let expects_delta = matches!(action, PatchAction::Update(u) if u.delta);
            if payload.is_delta() != expects_delta {
                return Err(PatchError::InvalidArchive(format!(
                    "payload form does not match action for {}",
                    action.path()
                )));
            }
        }
        Ok(())
    }

    /// Validate every action against the target, collecting all results.
    pub fn validate_all(&self, target_dir: &Path) -> Vec<ValidationResult> {
        self.actions
            .iter()
            .filter_map(|action| action.validate(target_dir, &self.policy))
            .collect()
    }

    /// Back up then apply each action in order, stopping at the first error.
    ///
    /// On error the store holds a backup for every action that was started,
    /// including the one that failed; pass it to [`Patch::revert_all`].
    pub fn apply_all(
        &self,
        target_dir: &Path,
        archive: &PatchArchive,
        backups: &mut BackupStore,
        decisions: &HashMap<String, Resolution>,
        cancel: &CancelToken,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        for action in &self.actions {
            if cancel.is_cancelled() {
                info!("Cancelled before {}", action.path());
                return Err(PatchError::Cancelled);
            }
            let decision = decisions.get(action.path()).copied();
            if !action.should_apply(target_dir, decision) {
                debug!("Skip: {}", action.path());
                summary.skipped += 1;
                continue;
            }
            action.backup(target_dir, backups)?;
            let applied = action.apply(target_dir, archive)?;
            summary.record(applied);
        }
        Ok(summary)
    }

    /// Undo every action that has a backup entry, last first.
    ///
    /// Keeps going after a failing action so as much as possible is restored,
    /// then reports the first failure.
    pub fn revert_all(&self, target_dir: &Path, backups: &BackupStore) -> Result<RevertSummary> {
        let mut summary = RevertSummary::default();
        let mut first_error = None;
        for action in self.actions.iter().rev() {
            match action.revert(target_dir, backups) {
                Ok(true) => summary.reverted += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to revert {}: {}", action.path(), e);
                    summary.failed += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

fn check_actions(actions: &[PatchAction]) -> Result<()> {
    let mut seen = HashSet::with_capacity(actions.len());
    for action in actions {
        if util::normalize_path(action.path())? != action.path() {
            return Err(PatchError::InvalidPath(action.path().to_string()));
        }
        if !seen.insert(action.path()) {
            return Err(PatchError::DuplicatePath(action.path().to_string()));
        }
    }

    // A directory delete must come after the deletes of everything beneath it,
    // otherwise the directory is never empty when its turn comes.
    for (i, dir) in actions.iter().enumerate() {
        if dir.kind() != ActionKind::Delete || dir.entry() != EntryKind::Dir {
            continue;
        }
        let late_child = actions[i + 1..].iter().find(|later| {
            later.kind() == ActionKind::Delete && util::is_under(later.path(), dir.path())
        });
        if let Some(child) = late_child {
            return Err(PatchError::OrderViolation {
                dir: dir.path().to_string(),
                child: child.path().to_string(),
            });
        }
    }
    Ok(())
}
