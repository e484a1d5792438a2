//! autoprop - propose or push automated changes
//!
//! CLI binary for applying a scripted change to one or many repositories
//! and publishing the result as a push or a merge proposal.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(name = "autoprop")]
#[command(about = "Propose or push automated changes to repositories")]
#[command(version)]
struct Cli {
    /// Increase log output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a command to one repository and publish the changes
    Run(cli::RunArgs),

    /// Apply a command across a list of repositories
    Batch(cli::BatchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "autoprop=debug" } else { "autoprop=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cli::run_run(args).await?,
        Commands::Batch(args) => cli::run_batch_cmd(args).await?,
    }

    Ok(())
}
