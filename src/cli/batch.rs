//! Batch command: apply a change command across a list of repositories.

use crate::cli::style::Stylize;
use autoprop::batch::{run_batch, Batch};
use autoprop::candidates::Candidates;
use autoprop::types::{derived_branch_name, Mode};
use autoprop::vcs::ProberRegistry;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the `batch` subcommand.
#[derive(Debug, Args)]
pub struct BatchArgs {
    /// Candidates file listing the repositories to change
    pub candidates: PathBuf,

    /// Command that makes the changes
    #[arg(long)]
    pub command: String,

    /// Name of the batch and its derived branches
    #[arg(long)]
    pub name: Option<String>,

    /// Where to keep the work list between runs
    #[arg(long, default_value = "batch.json")]
    pub state: PathBuf,

    /// Default publish mode for candidates without one
    #[arg(long, default_value_t = Mode::default())]
    pub mode: Mode,

    /// Report what would happen without publishing
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the `batch` subcommand.
///
/// An existing work list at the state path is resumed; otherwise a fresh
/// one is generated from the candidates file.
pub async fn run_batch_cmd(args: BatchArgs) -> anyhow::Result<()> {
    let mut batch = if args.state.exists() {
        println!("Resuming from {}", args.state.display().accent());
        Batch::load(&args.state)?
    } else {
        let candidates = Candidates::from_path(&args.candidates)?;
        let name = match args.name {
            Some(name) => name,
            None => derived_branch_name(&args.command).to_string(),
        };
        let batch = Batch::from_candidates(name, &args.command, args.mode, &candidates);
        batch.save(&args.state)?;
        batch
    };

    let registry = ProberRegistry::standard();
    let stats = run_batch(&mut batch, &args.state, &registry, args.dry_run).await?;

    println!(
        "{} published, {} without changes",
        stats.published.success(),
        stats.no_changes.muted()
    );
    if !stats.failures.is_empty() {
        let mut kinds: Vec<_> = stats.failures.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            eprintln!("{}", format!("{count} failed: {kind}").error());
        }
    }
    Ok(())
}
