//! Run command: apply a change command to one repository and publish.

use crate::cli::style::Stylize;
use anyhow::bail;
use autoprop::codemod::CommitPending;
use autoprop::run::{apply_and_publish, RunOptions, RunOutcome};
use autoprop::types::Mode;
use autoprop::vcs::ProberRegistry;
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use url::Url;

/// How to treat changes the command leaves uncommitted.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CommitPendingArg {
    /// Commit only when the command made no commits of its own.
    Auto,
    /// Always commit.
    Yes,
    /// Never commit.
    No,
}

impl From<CommitPendingArg> for CommitPending {
    fn from(arg: CommitPendingArg) -> Self {
        match arg {
            CommitPendingArg::Auto => Self::Auto,
            CommitPendingArg::Yes => Self::Yes,
            CommitPendingArg::No => Self::No,
        }
    }
}

/// Arguments for the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// URL of the repository to change
    pub url: Url,

    /// Command that makes the changes
    #[arg(long)]
    pub command: String,

    /// How to publish the result
    #[arg(long, default_value_t = Mode::default())]
    pub mode: Mode,

    /// Name of the derived branch (defaults to a name based on the command)
    #[arg(long)]
    pub name: Option<String>,

    /// Branch to target instead of the default branch
    #[arg(long)]
    pub branch: Option<String>,

    /// Subdirectory to run the command in
    #[arg(long)]
    pub subpath: Option<PathBuf>,

    /// Label to attach to a new merge proposal (repeatable)
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Reviewer to request on a new merge proposal (repeatable)
    #[arg(long = "reviewer")]
    pub reviewers: Vec<String>,

    /// Account that should own the derived branch
    #[arg(long)]
    pub derived_owner: Option<String>,

    /// Discard any earlier run's branch and start over from main
    #[arg(long)]
    pub refresh: bool,

    /// Update existing proposals only; never open a new one
    #[arg(long)]
    pub no_allow_create: bool,

    /// Report what would happen without publishing
    #[arg(long)]
    pub dry_run: bool,

    /// How to treat changes the command leaves uncommitted
    #[arg(long, value_enum, default_value = "auto")]
    pub commit_pending: CommitPendingArg,

    /// Print the diff of the changes
    #[arg(long)]
    pub diff: bool,
}

/// Run the `run` subcommand.
pub async fn run_run(args: RunArgs) -> anyhow::Result<()> {
    let mut options = RunOptions::new(args.url.clone(), args.command);
    options.mode = args.mode;
    options.name = args.name;
    options.branch = args.branch;
    options.subpath = args.subpath;
    options.labels = args.labels;
    options.reviewers = args.reviewers;
    options.derived_owner = args.derived_owner;
    options.refresh = args.refresh;
    options.allow_create_proposal = !args.no_allow_create;
    options.dry_run = args.dry_run;
    options.commit_pending = args.commit_pending.into();
    options.diff = args.diff;

    let registry = ProberRegistry::standard();
    match apply_and_publish(&registry, &options).await? {
        RunOutcome::Published {
            mode,
            proposal_url,
            is_new,
        } => {
            match (proposal_url, is_new) {
                (Some(url), Some(true)) => {
                    println!("{} Created proposal {}", "✓".success(), url.accent());
                }
                (Some(url), _) => {
                    println!("{} Updated proposal {}", "✓".success(), url.accent());
                }
                (None, _) => {
                    println!("{} Pushed changes ({})", "✓".success(), mode);
                }
            }
            Ok(())
        }
        RunOutcome::NoChanges => {
            println!("{}", "No changes to publish".muted());
            Ok(())
        }
        RunOutcome::ChangerFailed { reason } => {
            eprintln!("{}", format!("Command failed: {reason}").error());
            bail!("command failed against {}", args.url);
        }
    }
}
