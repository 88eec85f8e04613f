use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::action::PatchAction;
use crate::digest;
use crate::patch::{Patch, PatchStats};
use crate::patch_format::{ArchiveWriter, EntryKind, Payload, PatchMeta, PatchPolicy};
use crate::util::{self, DirEntry};

/// Authoring-time settings recorded into the patch.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub policy: PatchPolicy,
    pub meta: PatchMeta,
    /// Path prefixes left out of the comparison entirely.
    pub ignore: Vec<String>,
}

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where computing a binary diff would yield no meaningful savings.
fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "ico" | "avif"
            // Audio and video
            | "mp3" | "mp4" | "mkv" | "webm" | "ogg" | "flac" | "opus"
            // Archives and zip-based containers
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "jar" | "docx" | "xlsx"
            // Fonts
            | "woff" | "woff2"
            | "pdf"
        )
    )
}

struct Candidate {
    rel_path: String,
    old_path: PathBuf,
    new_path: PathBuf,
    sizes_differ: bool,
}

/// Compare `old_dir` with `new_dir` and write a patch that turns the former into the latter.
///
/// Actions are ordered so the patch applies safely front to back: directory
/// creates (parents first), file creates, updates, file deletes, then
/// directory deletes (deepest first).
pub async fn create_patch(
    old_dir: &Path,
    new_dir: &Path,
    output: &Path,
    options: CreateOptions,
) -> Result<PatchStats> {
    let old_dir_owned = old_dir.to_path_buf();
    let new_dir_owned = new_dir.to_path_buf();

    let (old_entries, new_entries) = tokio::try_join!(
        tokio::task::spawn_blocking(move || util::walk_directory(&old_dir_owned)),
        tokio::task::spawn_blocking(move || util::walk_directory(&new_dir_owned)),
    )?;

    let ignored = |e: &DirEntry| options.ignore.iter().any(|p| util::is_under(&e.relative_path, p));
    let old_entries: Vec<DirEntry> = old_entries
        .with_context(|| format!("Failed to walk {}", old_dir.display()))?
        .into_iter()
        .filter(|e| !ignored(e))
        .collect();
    let new_entries: Vec<DirEntry> = new_entries
        .with_context(|| format!("Failed to walk {}", new_dir.display()))?
        .into_iter()
        .filter(|e| !ignored(e))
        .collect();

    if let Some(link) = new_entries.iter().find(|e| e.symlink) {
        bail!("Symbolic links cannot be packaged: {}", link.relative_path);
    }

    let old_map: HashMap<&str, &DirEntry> = old_entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();
    let new_map: HashMap<&str, &DirEntry> = new_entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();

    let old_paths = util::path_set(&old_entries);
    let new_paths = util::path_set(&new_entries);

    let mut dirs_to_create: Vec<String> = Vec::new();
    let mut files_to_add: Vec<&DirEntry> = Vec::new();
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut files_to_delete: Vec<&DirEntry> = Vec::new();
    let mut dirs_to_delete: Vec<String> = Vec::new();

    for path in new_paths.difference(&old_paths) {
        let entry = new_map[path.as_str()];
        match entry.kind {
            EntryKind::Dir => dirs_to_create.push(path.clone()),
            EntryKind::File => files_to_add.push(entry),
        }
    }

    for path in old_paths.difference(&new_paths) {
        let entry = old_map[path.as_str()];
        match entry.kind {
            EntryKind::Dir => dirs_to_delete.push(path.clone()),
            EntryKind::File => files_to_delete.push(entry),
        }
    }

    for path in old_paths.intersection(&new_paths) {
        let (old, new) = (old_map[path.as_str()], new_map[path.as_str()]);
        match (old.kind, new.kind) {
            (EntryKind::File, EntryKind::File) => candidates.push(Candidate {
                rel_path: path.clone(),
                old_path: old.full_path.clone(),
                new_path: new.full_path.clone(),
                sizes_differ: old.size != new.size,
            }),
            (EntryKind::Dir, EntryKind::Dir) => {}
            _ => bail!("{} changes between file and directory", path),
        }
    }

    // Hash in parallel. Different sizes mean changed, but the old checksum is
    // still needed so apply can detect local edits.
    let updates: Vec<PatchAction> = candidates
        .par_iter()
        .map(|c| -> Result<Option<PatchAction>> {
            let old_sum = digest::digest(&c.old_path)?;
            let new_sum = digest::digest_file(&c.new_path)?;
            if !c.sizes_differ && old_sum == new_sum {
                return Ok(None);
            }
            let delta = !is_incompressible(&c.new_path);
            Ok(Some(PatchAction::update(&c.rel_path, Some(old_sum), new_sum, delta)))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    let creates: Vec<PatchAction> = files_to_add
        .par_iter()
        .map(|e| -> Result<PatchAction> {
            let sum = digest::digest_file(&e.full_path)?;
            Ok(PatchAction::create_file(&e.relative_path, sum))
        })
        .collect::<Result<_>>()?;

    let deletes: Vec<PatchAction> = files_to_delete
        .par_iter()
        .map(|e| -> Result<PatchAction> {
            let sum = digest::digest(&e.full_path)?;
            Ok(PatchAction::delete_file(&e.relative_path, Some(sum)))
        })
        .collect::<Result<_>>()?;

    util::sort_dirs_parent_first(&mut dirs_to_create);
    util::sort_dirs_deepest_first(&mut dirs_to_delete);

    let mut actions: Vec<PatchAction> = Vec::new();
    actions.extend(dirs_to_create.into_iter().map(PatchAction::create_dir));
    actions.extend(creates);
    actions.extend(updates);
    actions.extend(deletes);
    actions.extend(dirs_to_delete.into_iter().map(PatchAction::delete_dir));

    let patch = Patch::new(options.meta, options.policy, actions)?;

    let payloads: Vec<(String, Payload)> = patch
        .actions()
        .par_iter()
        .filter(|a| a.needs_payload())
        .map(|a| -> Result<(String, Payload)> {
            let payload = a
                .build_payload(old_dir, new_dir)?
                .with_context(|| format!("No payload built for {}", a.path()))?;
            Ok((a.path().to_string(), payload))
        })
        .collect::<Result<_>>()?;

    let mut writer = ArchiveWriter::new();
    for (path, payload) in payloads {
        writer.put(&path, payload);
    }
    writer
        .finish(&patch.to_header(), output)
        .with_context(|| format!("Failed to write patch: {}", output.display()))?;

    Ok(patch.stats())
}
