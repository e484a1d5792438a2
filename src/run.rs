//! End-to-end pipeline for one target repository.
//!
//! [`apply_and_publish`] strings the whole system together: open the main
//! branch, look for leftovers of a previous run, reconcile a workspace,
//! run the change producer, and publish the result. The batch layer and
//! the `run` subcommand both sit on top of it.

use crate::codemod::{ChangeOutcome, CommitPending, ScriptChanger};
use crate::error::{Error, Result};
use crate::forge::{determine_forge, Forge, MergeProposal};
use crate::publish::{find_existing_proposed, PublishRequest, StaticContent};
use crate::types::{derived_branch_name, Mode, RevisionId};
use crate::vcs::{probers_for, Branch, ProberRegistry, Vcs};
use crate::workspace::Workspace;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Everything one run needs.
#[derive(Clone)]
pub struct RunOptions {
    /// Repository to run against.
    pub url: Url,
    /// Shell command that makes the changes.
    pub command: String,
    /// How to publish.
    pub mode: Mode,
    /// Derived branch name; defaults to a name based on the command.
    pub name: Option<String>,
    /// Branch to target instead of the default branch.
    pub branch: Option<String>,
    /// Subdirectory to run the command in.
    pub subpath: Option<PathBuf>,
    /// Labels for a new proposal.
    pub labels: Vec<String>,
    /// Reviewers to request on a new proposal.
    pub reviewers: Vec<String>,
    /// Account to own the derived branch.
    pub derived_owner: Option<String>,
    /// Discard any earlier run's branch and start over from main.
    pub refresh: bool,
    /// Whether a brand-new proposal may be created.
    pub allow_create_proposal: bool,
    /// Report what would happen without publishing.
    pub dry_run: bool,
    /// How to treat changes the command leaves uncommitted.
    pub commit_pending: CommitPending,
    /// Write the diff of the changes to stdout.
    pub diff: bool,
}

impl RunOptions {
    /// Options for running `command` against `url` with defaults.
    pub fn new(url: Url, command: impl Into<String>) -> Self {
        Self {
            url,
            command: command.into(),
            mode: Mode::default(),
            name: None,
            branch: None,
            subpath: None,
            labels: Vec::new(),
            reviewers: Vec::new(),
            derived_owner: None,
            refresh: false,
            allow_create_proposal: true,
            dry_run: false,
            commit_pending: CommitPending::default(),
            diff: false,
        }
    }

    fn branch_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => derived_branch_name(&self.command).to_string(),
        }
    }
}

/// How one run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Changes were published.
    Published {
        /// The mode that actually ran.
        mode: Mode,
        /// Proposal URL, for proposal modes.
        proposal_url: Option<Url>,
        /// Whether the proposal is new.
        is_new: Option<bool>,
    },
    /// The producer ran but the branch ended up unchanged.
    NoChanges,
    /// The producer reported a failure.
    ChangerFailed {
        /// Producer-supplied reason.
        reason: String,
    },
}

async fn open_main_branch(
    registry: &ProberRegistry,
    url: &Url,
    name: Option<&str>,
) -> Result<(Arc<dyn Vcs>, Arc<dyn Branch>)> {
    let mut last_err = None;
    for prober in probers_for(None, registry) {
        if !prober.supports_url(url) {
            continue;
        }
        match prober.open_branch(url, name).await {
            Ok(branch) => return Ok((prober, branch)),
            Err(e) => {
                tracing::debug!("prober {} failed for {}: {}", prober.vcs_type(), url, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => Error::BranchOpen(crate::error::BranchOpenError::Unsupported {
            url: url.clone(),
            description: "no backend recognises this URL".to_string(),
            vcs: None,
        }),
    })
}

/// Run the full pipeline against one repository.
///
/// A missing forge is tolerated in push mode only; every other mode needs
/// one to create proposals or derived branches.
pub async fn apply_and_publish(
    registry: &ProberRegistry,
    options: &RunOptions,
) -> Result<RunOutcome> {
    let name = options.branch_name();
    let (vcs, main_branch) =
        open_main_branch(registry, &options.url, options.branch.as_deref()).await?;

    let forge: Option<Arc<dyn Forge>> = match determine_forge(&main_branch.url()).await {
        Ok(forge) => Some(forge),
        Err(Error::UnsupportedForge(url)) => {
            if options.mode == Mode::Push {
                // Proceed without forge support; we cannot tell what
                // branch to resume from.
                tracing::warn!("unsupported forge, will attempt to push to {}", url);
                None
            } else {
                return Err(Error::UnsupportedForge(url));
            }
        }
        Err(e) => return Err(e),
    };

    let (resume_branch, overwrite, existing_proposals) = match forge.as_ref() {
        Some(forge) if !options.refresh => {
            find_existing_proposed(
                main_branch.as_ref(),
                forge.as_ref(),
                &name,
                false,
                options.derived_owner.as_deref(),
            )
            .await?
        }
        _ => (None, None, None),
    };
    let overwrite = if options.refresh {
        true
    } else {
        overwrite.unwrap_or(true)
    };
    let existing_proposal: Option<Arc<dyn MergeProposal>> =
        existing_proposals.and_then(|mut proposals| {
            if proposals.len() > 1 {
                tracing::warn!(
                    "multiple open proposals for branch {}, updating the first",
                    name
                );
            }
            if proposals.is_empty() {
                None
            } else {
                Some(proposals.remove(0))
            }
        });

    let mut builder = Workspace::builder().main_branch(main_branch.clone());
    if let Some(resume) = resume_branch.clone() {
        builder = builder.resume_branch(resume);
    }
    let workspace = builder.build(vcs.clone()).await?;

    let mut changer = ScriptChanger::new(&options.command).commit_pending(options.commit_pending);
    if let Some(subpath) = &options.subpath {
        changer = changer.subpath(subpath);
    }
    let result = match workspace.run_changer(&changer).await? {
        ChangeOutcome::Success(result) => result,
        ChangeOutcome::NoChanges => {
            // The target may still be ahead of an earlier proposal; stale
            // closure is publish's job, but with nothing to publish we are
            // done here.
            tracing::info!("{}: no changes", options.url);
            return Ok(RunOutcome::NoChanges);
        }
        ChangeOutcome::Failed { reason } => {
            tracing::warn!("{}: changer failed: {}", options.url, reason);
            return Ok(RunOutcome::ChangerFailed { reason });
        }
    };

    if !workspace.any_branch_changes().await? {
        tracing::info!("{}: no effective changes", options.url);
        return Ok(RunOutcome::NoChanges);
    }

    if options.diff {
        let mut out = Vec::new();
        workspace.show_diff(&mut out, None, None).await?;
        let mut stdout = std::io::stdout().lock();
        std::io::Write::write_all(&mut stdout, &out)?;
    }

    if options.dry_run {
        tracing::info!("{}: dry run, not publishing", options.url);
        return Ok(RunOutcome::NoChanges);
    }

    // The producer may redirect the proposal at a different target branch.
    let target_override = match &result.target_branch_url {
        Some(url) => {
            let (_, branch) = open_main_branch(registry, url, None).await?;
            Some(branch)
        }
        None => None,
    };

    let description = result
        .description
        .clone()
        .unwrap_or_else(|| format!("Apply `{}`", options.command));
    let content = StaticContent {
        description,
        commit_message: result.commit_message.clone(),
        title: result.title.clone(),
    };
    let tags: HashMap<String, RevisionId> = result
        .tags
        .iter()
        .filter_map(|(k, v)| v.clone().map(|r| (k.clone(), r)))
        .collect();

    let mut request = PublishRequest::new(options.mode, name);
    request.labels = options.labels.clone();
    request.reviewers = options.reviewers.clone();
    request.derived_owner = options.derived_owner.clone();
    request.allow_create_proposal = options.allow_create_proposal;
    request.overwrite_existing = overwrite;
    request.existing_proposal = existing_proposal;
    if !tags.is_empty() {
        request.tags = Some(tags);
    }

    let publish_result = workspace
        .publish_changes(
            target_override.as_deref(),
            forge,
            &content,
            &request,
        )
        .await?;

    if let Some(proposal) = publish_result.proposal.as_ref() {
        if publish_result.is_new == Some(true) {
            tracing::info!("merge proposal created: {}", proposal.url());
        } else {
            tracing::info!("merge proposal updated: {}", proposal.url());
        }
    }
    Ok(RunOutcome::Published {
        mode: publish_result.mode,
        proposal_url: publish_result.proposal.as_ref().map(|p| p.url()),
        is_new: publish_result.is_new,
    })
}
