use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use treepatch::patch_format::PatchArchive;
use treepatch::{
    create_patch, ApplySummary, CreateOptions, Patch, PatchMeta, PatchPolicy, PatchStats,
    Resolution, Resolutions, Runner,
};

#[derive(Parser)]
#[command(name = "treepatch", about = "Transactional directory patch creator and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Never offer to keep local content on conflicts
        #[arg(long)]
        strict: bool,
        /// Delete files without checking them against their recorded checksum
        #[arg(long)]
        no_validate_deletion: bool,
        /// Path prefix whose conflicts must follow the patch (repeatable)
        #[arg(long, value_name = "PREFIX")]
        critical: Vec<String>,
        /// Path prefix deleted without content checks (repeatable)
        #[arg(long, value_name = "PREFIX")]
        force_delete: Vec<String>,
        /// Path prefix left out of the comparison (repeatable)
        #[arg(long, value_name = "PREFIX")]
        ignore: Vec<String>,
        /// Label of the old version
        #[arg(long)]
        old_version: Option<String>,
        /// Label of the new version
        #[arg(long)]
        new_version: Option<String>,
    },
    /// Print a patch's metadata, policy and actions
    Inspect {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Report every conflict a patch would hit, without changing anything
    Validate {
        /// Path to the target directory
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Where to keep backups while applying (must be empty or absent)
        #[arg(long)]
        backup_dir: Option<PathBuf>,
        /// Resolution for one conflicting path, as PATH=OPTION (repeatable)
        #[arg(long, value_name = "PATH=OPTION", value_parser = parse_resolution)]
        resolve: Vec<(String, Resolution)>,
        /// Take the first offered option for every conflict not resolved explicitly
        #[arg(long)]
        accept_defaults: bool,
    },
}

fn parse_resolution(raw: &str) -> Result<(String, Resolution), String> {
    let (path, option) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected PATH=OPTION, got {raw}"))?;
    Ok((path.to_string(), option.parse()?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the report on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("treepatch=info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            strict,
            no_validate_deletion,
            critical,
            force_delete,
            ignore,
            old_version,
            new_version,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let options = CreateOptions {
                policy: PatchPolicy {
                    strict,
                    validate_deletion: !no_validate_deletion,
                    critical,
                    force_delete,
                },
                meta: PatchMeta {
                    old_version,
                    new_version,
                },
                ignore,
            };

            let start = Instant::now();
            let stats = create_patch(&old, &new, &output, options).await?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            print_stats(&stats);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Inspect { patch } => {
            let header = PatchArchive::read_header(&patch)
                .with_context(|| format!("Failed to read patch: {}", patch.display()))?;
            let patch = Patch::from_header(header)?;

            println!(
                "Versions: {} -> {}",
                patch.meta.old_version.as_deref().unwrap_or("?"),
                patch.meta.new_version.as_deref().unwrap_or("?")
            );
            println!(
                "Policy: strict={} validate_deletion={} critical={:?} force_delete={:?}",
                patch.policy.strict,
                patch.policy.validate_deletion,
                patch.policy.critical,
                patch.policy.force_delete
            );
            print_stats(&patch.stats());
            for action in patch.actions() {
                let record = action.to_record();
                let old = record.checksum_old.map(|c| c.to_string());
                let new = record.checksum_new.map(|c| c.to_string());
                println!(
                    "  {:?} {:?} {} old={} new={}",
                    record.kind,
                    record.entry,
                    record.path,
                    old.as_deref().unwrap_or("-"),
                    new.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Validate { target, patch } => {
            let header = PatchArchive::read_header(&patch)
                .with_context(|| format!("Failed to read patch: {}", patch.display()))?;
            let patch = Patch::from_header(header)?;
            let results = patch.validate_all(&target);

            if results.is_empty() {
                println!("No conflicts.");
            } else {
                for result in &results {
                    println!("  {}", result);
                }
                bail!("{} conflict(s) found", results.len());
            }
        }
        Commands::Apply {
            target,
            patch,
            backup_dir,
            resolve,
            accept_defaults,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let backup_dir = backup_dir.unwrap_or_else(|| {
                std::env::temp_dir().join(format!("treepatch-backup-{}", std::process::id()))
            });
            let mut resolutions = if accept_defaults {
                Resolutions::accepting_defaults()
            } else {
                Resolutions::new()
            };
            for (path, option) in resolve {
                resolutions.choose(path, option);
            }

            let mut runner = Runner::open(&patch, &target, &backup_dir)?;
            let cancel = runner.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let start = Instant::now();
            let summary: ApplySummary = tokio::task::spawn_blocking(move || {
                let results = runner.validate()?;
                for result in results {
                    println!("  {}", result);
                }
                let summary = runner.apply(&resolutions)?;
                runner.commit()?;
                Ok::<_, treepatch::PatchError>(summary)
            })
            .await??;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Directories created: {}", summary.dirs_created);
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.dirs_deleted);
            println!("  Preserved: {}", summary.preserved);
            println!("  Skipped: {}", summary.skipped);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}

fn print_stats(stats: &PatchStats) {
    println!("  Directories created: {}", stats.dirs_created);
    println!("  Files added: {}", stats.files_added);
    println!("  Files modified: {}", stats.files_modified);
    println!("  Files deleted: {}", stats.files_deleted);
    println!("  Directories deleted: {}", stats.dirs_deleted);
}
