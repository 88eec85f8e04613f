//! Transactional patching of directory trees.
//!
//! A patch is an ordered list of create / update / delete actions packed into
//! a single archive together with the content they write. Applying it is a
//! transaction driven by [`Runner`]:
//!
//! 1. every action is validated against the live tree and all conflicts are
//!    reported at once, each with the resolutions the caller may pick;
//! 2. actions run in order, each backing up the path it touches first;
//! 3. if any action fails, everything already applied is reverted in reverse
//!    order from those backups.
//!
//! ```no_run
//! use std::path::Path;
//! use treepatch::{Resolutions, Runner};
//!
//! let mut runner = Runner::open(
//!     Path::new("update.patch"),
//!     Path::new("/opt/app"),
//!     Path::new("/tmp/app-backup"),
//! )?;
//! for conflict in runner.validate()? {
//!     println!("{conflict}");
//! }
//! runner.apply(&Resolutions::accepting_defaults())?;
//! runner.commit()?;
//! # Ok::<(), treepatch::PatchError>(())
//! ```

pub mod action;
pub mod backup;
pub mod create;
pub mod delta;
pub mod digest;
pub mod error;
pub mod patch;
pub mod patch_format;
pub mod runner;
pub mod util;
pub mod validation;

pub use action::{Applied, PatchAction};
pub use backup::{BackupEntry, BackupStore};
pub use create::{create_patch, CreateOptions};
pub use digest::Checksum;
pub use error::{PatchError, Result};
pub use patch::{ApplySummary, Patch, PatchStats, RevertSummary};
pub use patch_format::{PatchArchive, PatchMeta, PatchPolicy};
pub use runner::{CancelToken, Runner, RunnerState};
pub use validation::{Resolution, Resolutions, ValidationResult};
