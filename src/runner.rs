//! Drives one patch transaction against a target tree.
//!
//! ```text
//! Loaded -> Validating -> Validated -> Applying -> Applied -> Committed
//!                                          |           \-> Reverting -> Reverted
//!                                          \-> Failed -> Reverting -> Reverted
//! ```
//!
//! The target directory and the backup directory are assumed to be owned
//! exclusively by the runner for the whole transaction.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backup::BackupStore;
use crate::error::{PatchError, Result};
use crate::patch::{ApplySummary, Patch, RevertSummary};
use crate::patch_format::PatchArchive;
use crate::validation::{Resolutions, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Loaded,
    Validating,
    Validated,
    Applying,
    Applied,
    Committed,
    Failed,
    Reverting,
    Reverted,
}

impl RunnerState {
    fn name(self) -> &'static str {
        match self {
            RunnerState::Loaded => "loaded",
            RunnerState::Validating => "validating",
            RunnerState::Validated => "validated",
            RunnerState::Applying => "applying",
            RunnerState::Applied => "applied",
            RunnerState::Committed => "committed",
            RunnerState::Failed => "failed",
            RunnerState::Reverting => "reverting",
            RunnerState::Reverted => "reverted",
        }
    }
}

/// Stops an apply pass between two actions. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Runner {
    patch: Patch,
    archive: PatchArchive,
    target: PathBuf,
    backups: BackupStore,
    state: RunnerState,
    results: Vec<ValidationResult>,
    cancel: CancelToken,
}

impl Runner {
    /// Load a patch archive for application to `target`, backing up into `backup_dir`.
    pub fn open(patch_file: &Path, target: &Path, backup_dir: &Path) -> Result<Self> {
        let archive = PatchArchive::open(patch_file)?;
        Runner::from_archive(archive, target, backup_dir)
    }

    pub fn from_archive(archive: PatchArchive, target: &Path, backup_dir: &Path) -> Result<Self> {
        let patch = Patch::from_header(archive.header.clone())?;
        patch.check_payloads(&archive)?;
        info!(
            "Loaded patch with {} actions for {}",
            patch.actions().len(),
            target.display()
        );
        Ok(Runner {
            patch,
            archive,
            target: target.to_path_buf(),
            backups: BackupStore::new(backup_dir),
            state: RunnerState::Loaded,
            results: Vec::new(),
            cancel: CancelToken::new(),
        })
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn backup_dir(&self) -> &Path {
        self.backups.root()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Results of the last validation pass.
    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    /// Check every action against the target. Never mutates the tree.
    pub fn validate(&mut self) -> Result<&[ValidationResult]> {
        self.expect(&[RunnerState::Loaded, RunnerState::Validated], "loaded or validated")?;
        self.transition(RunnerState::Validating);
        self.results = self.patch.validate_all(&self.target);
        for result in &self.results {
            warn!("{}", result);
        }
        self.transition(RunnerState::Validated);
        Ok(&self.results)
    }

    /// Apply every action, reverting all of them if any fails.
    ///
    /// Validation runs first if it has not yet. Every result must have an
    /// offered resolution; nothing is touched otherwise. On success the
    /// runner is `Applied` and backups stay on disk until [`Runner::commit`]
    /// or [`Runner::revert`].
    pub fn apply(&mut self, resolutions: &Resolutions) -> Result<ApplySummary> {
        if self.state == RunnerState::Loaded {
            self.validate()?;
        }
        self.expect(&[RunnerState::Validated], "validated")?;
        let decisions = resolutions.settle(&self.results)?;
        self.backups.prepare()?;

        self.transition(RunnerState::Applying);
        let outcome = self.patch.apply_all(
            &self.target,
            &self.archive,
            &mut self.backups,
            &decisions,
            &self.cancel,
        );

        match outcome {
            Ok(summary) => {
                self.transition(RunnerState::Applied);
                Ok(summary)
            }
            Err(cause) => {
                error!("Apply failed: {}", cause);
                self.transition(RunnerState::Failed);
                match self.revert_inner() {
                    Ok(_) if matches!(cause, PatchError::Cancelled) => Err(cause),
                    Ok(_) => Err(PatchError::ApplyFailed(Box::new(cause))),
                    Err(revert) => Err(PatchError::RevertFailed {
                        cause: Box::new(cause),
                        revert: Box::new(revert),
                        backup_dir: self.backups.root().to_path_buf(),
                    }),
                }
            }
        }
    }

    /// Make an applied patch permanent by discarding its backups.
    pub fn commit(&mut self) -> Result<()> {
        self.expect(&[RunnerState::Applied], "applied")?;
        self.backups.discard()?;
        self.transition(RunnerState::Committed);
        Ok(())
    }

    /// Undo a fully applied, not yet committed patch.
    pub fn revert(&mut self) -> Result<RevertSummary> {
        self.expect(&[RunnerState::Applied], "applied")?;
        self.revert_inner()
    }

    fn revert_inner(&mut self) -> Result<RevertSummary> {
        self.transition(RunnerState::Reverting);
        match self.patch.revert_all(&self.target, &self.backups) {
            Ok(summary) => {
                info!("Reverted {} actions", summary.reverted);
                // The tree is already restored; leftover backups are only clutter.
                if let Err(e) = self.backups.discard() {
                    warn!(
                        "Could not remove backups in {}: {}",
                        self.backups.root().display(),
                        e
                    );
                }
                self.transition(RunnerState::Reverted);
                Ok(summary)
            }
            Err(e) => {
                // Backups stay on disk for manual recovery.
                error!(
                    "Revert failed, backups kept in {}: {}",
                    self.backups.root().display(),
                    e
                );
                self.transition(RunnerState::Failed);
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: RunnerState) {
        info!("Runner: {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    fn expect(&self, allowed: &[RunnerState], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PatchError::InvalidState {
                expected,
                actual: self.state.name(),
            })
        }
    }
}
