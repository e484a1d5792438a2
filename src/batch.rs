//! Batch runs: apply one command across many repositories, with a
//! persistent work list.
//!
//! The work list is a versioned JSON document saved after every target, so
//! an interrupted run picks up where it left off. Failures are recorded
//! per target and never stop the batch.

use crate::candidates::Candidates;
use crate::error::{Error, Result};
use crate::run::{apply_and_publish, RunOptions, RunOutcome};
use crate::types::Mode;
use crate::vcs::ProberRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use url::Url;

/// Current version of the work list format.
pub const CURRENT_VERSION: u8 = 1;

/// Where one entry stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum EntryResult {
    /// Not attempted yet.
    Pending,
    /// Changes were published.
    Published {
        /// Proposal URL, for proposal modes.
        #[serde(rename = "proposal-url", skip_serializing_if = "Option::is_none")]
        proposal_url: Option<Url>,
    },
    /// The command produced no effective changes.
    NoChanges,
    /// The attempt failed.
    Failed {
        /// Stable error label, for statistics.
        kind: String,
        /// Human-readable message.
        message: String,
    },
}

/// One repository in the work list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Repository URL.
    pub url: Url,

    /// Publish mode for this entry.
    pub mode: Mode,

    /// Branch to target instead of the default branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Subdirectory to run the command in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<std::path::PathBuf>,

    /// Outcome of the last attempt.
    #[serde(default = "pending")]
    pub result: EntryResult,

    /// When the last attempt finished.
    #[serde(
        rename = "finished-at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub finished_at: Option<DateTime<Utc>>,
}

fn pending() -> EntryResult {
    EntryResult::Pending
}

/// A persistent batch work list.
#[derive(Debug, Serialize, Deserialize)]
pub struct Batch {
    /// Format version.
    pub version: u8,

    /// Batch name; also the derived branch name.
    pub name: String,

    /// Shell command applied to every target.
    pub command: String,

    /// Work keyed by candidate short name.
    pub work: BTreeMap<String, Entry>,
}

impl Batch {
    /// Build a fresh work list from a candidates file.
    pub fn from_candidates(
        name: impl Into<String>,
        command: impl Into<String>,
        default_mode: Mode,
        candidates: &Candidates,
    ) -> Self {
        let mut work = BTreeMap::new();
        for candidate in candidates.iter() {
            work.insert(
                candidate.shortname(),
                Entry {
                    url: candidate.url.clone(),
                    mode: candidate.default_mode.unwrap_or(default_mode),
                    branch: candidate.branch.clone(),
                    subpath: candidate.subpath.clone(),
                    result: EntryResult::Pending,
                    finished_at: None,
                },
            );
        }
        Self {
            version: CURRENT_VERSION,
            name: name.into(),
            command: command.into(),
            work,
        }
    }

    /// Load a work list from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let batch: Self = serde_json::from_str(&text)?;
        if batch.version != CURRENT_VERSION {
            return Err(Error::Other(format!(
                "unsupported batch version {}",
                batch.version
            )));
        }
        Ok(batch)
    }

    /// Save the work list to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Names of entries that still need an attempt.
    pub fn pending(&self) -> Vec<String> {
        self.work
            .iter()
            .filter(|(_, e)| e.result == EntryResult::Pending)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Per-kind counts of how a batch went.
#[derive(Debug, Default)]
pub struct BatchStats {
    /// Targets with published changes.
    pub published: usize,
    /// Targets with nothing to publish.
    pub no_changes: usize,
    /// Failure counts by error label.
    pub failures: HashMap<String, usize>,
}

/// Run every pending entry, saving the work list after each.
///
/// Failures are recorded on the entry and the batch moves on; the stats
/// say how the run went overall.
pub async fn run_batch(
    batch: &mut Batch,
    state_path: &Path,
    registry: &ProberRegistry,
    dry_run: bool,
) -> Result<BatchStats> {
    let mut stats = BatchStats::default();
    for name in batch.pending() {
        let entry = match batch.work.get(&name) {
            Some(entry) => entry.clone(),
            None => continue,
        };
        tracing::info!("processing {} ({})", name, entry.url);

        let mut options = RunOptions::new(entry.url.clone(), batch.command.clone());
        options.mode = entry.mode;
        options.name = Some(batch.name.clone());
        options.branch = entry.branch.clone();
        options.subpath = entry.subpath.clone();
        options.dry_run = dry_run;

        let result = match apply_and_publish(registry, &options).await {
            Ok(RunOutcome::Published {
                proposal_url, ..
            }) => {
                stats.published += 1;
                EntryResult::Published { proposal_url }
            }
            Ok(RunOutcome::NoChanges) => {
                stats.no_changes += 1;
                EntryResult::NoChanges
            }
            Ok(RunOutcome::ChangerFailed { reason }) => {
                *stats.failures.entry("changer".to_string()).or_default() += 1;
                EntryResult::Failed {
                    kind: "changer".to_string(),
                    message: reason,
                }
            }
            Err(e) => {
                tracing::warn!("{}: {}", entry.url, e);
                *stats.failures.entry(e.kind().to_string()).or_default() += 1;
                EntryResult::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }
            }
        };

        if let Some(entry) = batch.work.get_mut(&name) {
            entry.result = result;
            entry.finished_at = Some(Utc::now());
        }
        batch.save(state_path)?;
    }
    Ok(stats)
}
