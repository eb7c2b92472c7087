//! AVC command-line interface

mod gitignore;
mod push_local;

use anyhow::{Context, Result};
use avc_core::{discover_toplevel, load_plan, Avc, CommitId, FileState, GlobalStore, StageOutcome};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "avc")]
#[command(author = "AVC Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Append-only versioning for large binary files", long_about = None)]
struct Cli {
    /// Repository toplevel (default: nearest parent containing .git)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create .avc/ in this repository
    Init {
        /// Directory tracked paths are relative to (default: repository)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Set up local state after cloning a repository that has .avc/
    Cloned {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show refs and staged changes
    Status,

    /// List commits reachable from main
    Log,

    /// Stage new bytes of one or more files
    Add {
        /// Paths relative to the data directory
        #[arg(required = true)]
        paths: Vec<String>,
        /// Stage only the first N bytes (single path only)
        #[arg(long)]
        num_bytes: Option<u64>,
    },

    /// Drop all staged changes
    ResetStaged,

    /// Seal staged changes into a commit and write the operation plan
    BuildGitCommit {
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove the last commit
    AbortLastCommit,

    /// Apply every commit between HEAD and main
    FastForward,

    /// Compare working files with their committed lengths
    Verify,

    /// Materialize an operation plan into a local directory
    PushLocal {
        dest: PathBuf,
        /// Plan file (default: .avc/git_operations.json)
        #[arg(long)]
        plan: Option<PathBuf>,
        #[arg(long, default_value_t = push_local::DEFAULT_JOBS)]
        jobs: usize,
    },
}

fn toplevel(cli_repo: Option<&Path>) -> Result<PathBuf> {
    match cli_repo {
        Some(repo) => repo
            .canonicalize()
            .with_context(|| format!("Repository {} not found", repo.display())),
        None => {
            let cwd = std::env::current_dir()?;
            Ok(discover_toplevel(&cwd)?)
        }
    }
}

fn display_ref(id: Option<&CommitId>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

fn announce_ignored(toplevel: &Path) -> Result<()> {
    for entry in gitignore::ensure_ignored(toplevel)? {
        println!("Adding {} to .gitignore", entry);
    }
    Ok(())
}

fn report_staged(path: &str, outcome: StageOutcome) {
    match outcome {
        StageOutcome::Created(s) | StageOutcome::Grown(s) => {
            println!("Staged {} {} [{}..{})", s.change_type, s.path, s.start_offset, s.end_offset());
        }
        StageOutcome::Unchanged(s) => {
            println!("{} already staged up to {}", s.path, s.end_offset());
        }
        StageOutcome::NothingNew { committed, declared } => {
            println!(
                "Nothing new to add with {} bytes: {} already has {} committed bytes",
                declared, path, committed
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let root = toplevel(cli.repo.as_deref())?;

    match cli.command {
        Commands::Init { data_dir } => {
            Avc::init(&root, data_dir.as_deref())?;
            announce_ignored(&root)?;
        }

        Commands::Cloned { data_dir } => {
            Avc::cloned(&root, data_dir.as_deref())?;
            announce_ignored(&root)?;
        }

        Commands::Status => {
            let avc = Avc::open(&root)?;
            let status = avc.status()?;
            println!("data:  {}", avc.layout().data_toplevel().display());
            println!("HEAD:  {}", display_ref(status.head.as_ref()));
            println!("main:  {}", display_ref(status.main.as_ref()));
            if !status.is_up_to_date() {
                println!("HEAD is behind main; run `avc fast-forward`");
            }
            if status.staged.is_empty() {
                println!("No staged changes");
            } else {
                println!("Staged changes:");
                for s in &status.staged {
                    println!(
                        "  {:<6} {} [{}..{})",
                        s.change_type,
                        s.path,
                        s.start_offset,
                        s.end_offset()
                    );
                }
            }
        }

        Commands::Log => {
            let avc = Avc::open(&root)?;
            for commit in avc.log()? {
                let changes = avc.global().changes(&commit.id)?;
                let bytes: u64 = changes.iter().map(|c| c.num_bytes).sum();
                println!("{}  {} changes, {} bytes", commit.id, changes.len(), bytes);
            }
        }

        Commands::Add { paths, num_bytes } => {
            if num_bytes.is_some() && paths.len() > 1 {
                anyhow::bail!("--num-bytes applies to a single path");
            }
            let mut avc = Avc::open(&root)?;
            for path in &paths {
                report_staged(path, avc.stage(path, num_bytes)?);
            }
        }

        Commands::ResetStaged => {
            Avc::open(&root)?.reset_staging()?;
        }

        Commands::BuildGitCommit { dry_run } => {
            let mut avc = Avc::open(&root)?;
            let plan = avc.build_commit(dry_run)?;
            match plan.commit_id {
                None => println!("No staged changes"),
                Some(id) => {
                    println!("{}", id);
                    println!("You now MUST push the operations in the following file to the remote:");
                    println!("{}", avc.layout().plan_path().display());
                }
            }
        }

        Commands::AbortLastCommit => {
            let mut avc = Avc::open(&root)?;
            match avc.abort_last_commit()? {
                Some(id) => println!("Aborted {}", id),
                None => println!("No commits to abort"),
            }
        }

        Commands::FastForward => {
            let mut avc = Avc::open(&root)?;
            for report in avc.fast_forward()? {
                println!(
                    "Applied {} ({} steps applied, {} skipped)",
                    report.commit_id,
                    report.applied,
                    report.skipped()
                );
            }
        }

        Commands::Verify => {
            let avc = Avc::open(&root)?;
            let report = avc.verify()?;
            for entry in &report.entries {
                match entry.state {
                    FileState::Intact => {}
                    FileState::Missing => println!("missing  {}", entry.path),
                    FileState::Short { actual } => {
                        println!("short    {} ({} of {} bytes)", entry.path, actual, entry.committed)
                    }
                    FileState::Longer { actual } => {
                        println!("longer   {} ({} of {} bytes)", entry.path, actual, entry.committed)
                    }
                }
            }
            if !report.is_clean() {
                anyhow::bail!("{} tracked files are damaged", report.damaged().count());
            }
            println!("{} tracked files verified", report.entries.len());
        }

        Commands::PushLocal { dest, plan, jobs } => {
            let plan_path = match plan {
                Some(p) => p,
                None => Avc::open(&root)?.layout().plan_path(),
            };
            let ops = load_plan(&plan_path)
                .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;
            info!("Loaded {} operations from {}", ops.len(), plan_path.display());
            let stats = push_local::push_plan(ops, dest, jobs).await?;
            println!("{}", stats.summary());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accepts_several_paths() {
        let cli = Cli::try_parse_from(["avc", "add", "a.bin", "logs/b.bin"]).unwrap();
        let Commands::Add { paths, num_bytes } = cli.command else {
            panic!("expected add");
        };
        assert_eq!(paths, vec!["a.bin", "logs/b.bin"]);
        assert_eq!(num_bytes, None);
    }

    #[test]
    fn test_add_requires_a_path() {
        assert!(Cli::try_parse_from(["avc", "add"]).is_err());
    }
}
