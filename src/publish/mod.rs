//! The publish engine.
//!
//! [`publish_changes`] is the single entry point: given a reconciled local
//! branch, a target, and a [`PublishRequest`], it pushes directly, pushes a
//! derived branch, or creates/updates a merge proposal, falling back from
//! push to propose when write access is denied. The decision sequence is
//! ordered so that every reachable outcome is explicit: stale proposals are
//! closed before anything is pushed, direct pushes are refused when the
//! target has unmerged history, and empty proposals are refused before a
//! derived branch is published.

use crate::error::{Error, Result};
use crate::forge::{
    determine_forge, DescriptionFormat, Forge, MergeProposal, ProposalRequest, ProposalStatus,
};
use crate::types::{Mode, RevisionId};
use crate::vcs::{Branch, Vcs};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use url::Url;

fn tag_selector(
    tags: Option<&HashMap<String, RevisionId>>,
) -> Box<dyn Fn(&str) -> bool + Send + Sync> {
    let names: HashSet<String> = tags
        .map(|t| t.keys().cloned().collect())
        .unwrap_or_default();
    Box::new(move |tag| names.contains(tag))
}

/// Derive a proposal title from the first line of a description.
pub fn determine_title(description: &str) -> Option<String> {
    let line = description.lines().find(|l| !l.trim().is_empty())?;
    let title = line.trim_start_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some(title.trim_end_matches('.').to_string())
    }
}

/// Pre-fetched state of an existing proposal, handed to content renderers
/// so they can stay synchronous.
#[derive(Debug, Clone)]
pub struct ProposalSnapshot {
    /// Proposal URL.
    pub url: Url,
    /// Current body text.
    pub description: Option<String>,
    /// Current merge commit message.
    pub commit_message: Option<String>,
    /// Current title.
    pub title: Option<String>,
}

async fn snapshot_proposal(proposal: &dyn MergeProposal) -> Result<ProposalSnapshot> {
    Ok(ProposalSnapshot {
        url: proposal.url(),
        description: proposal.get_description().await?,
        commit_message: proposal.get_commit_message().await?,
        title: proposal.get_title().await?,
    })
}

/// Renders the text that goes on a proposal.
///
/// Implementations see the existing proposal (when one is being updated) so
/// they can fold earlier text into the new version.
pub trait ProposalContent: Send + Sync {
    /// The proposal body, in the forge's format.
    fn description(
        &self,
        format: DescriptionFormat,
        existing: Option<&ProposalSnapshot>,
    ) -> String;

    /// The merge commit message, where the forge supports one.
    fn commit_message(&self, _existing: Option<&ProposalSnapshot>) -> Option<String> {
        None
    }

    /// The proposal title; `None` derives one from the description.
    fn title(&self, _existing: Option<&ProposalSnapshot>) -> Option<String> {
        None
    }
}

/// Fixed proposal text.
#[derive(Debug, Clone, Default)]
pub struct StaticContent {
    /// Body text.
    pub description: String,
    /// Merge commit message.
    pub commit_message: Option<String>,
    /// Title.
    pub title: Option<String>,
}

impl ProposalContent for StaticContent {
    fn description(
        &self,
        _format: DescriptionFormat,
        _existing: Option<&ProposalSnapshot>,
    ) -> String {
        self.description.clone()
    }

    fn commit_message(&self, _existing: Option<&ProposalSnapshot>) -> Option<String> {
        self.commit_message.clone()
    }

    fn title(&self, _existing: Option<&ProposalSnapshot>) -> Option<String> {
        self.title.clone()
    }
}

/// Everything that shapes one publication.
#[derive(Clone, Default)]
pub struct PublishRequest {
    /// How to publish.
    pub mode: Mode,
    /// Derived branch name.
    pub name: String,
    /// Whether a brand-new proposal may be created.
    pub allow_create_proposal: bool,
    /// Labels for a new proposal.
    pub labels: Vec<String>,
    /// Reviewers to request on a new proposal.
    pub reviewers: Vec<String>,
    /// Whether an existing unrelated derived branch may be overwritten.
    pub overwrite_existing: bool,
    /// Proposal from a previous run, to update instead of creating.
    pub existing_proposal: Option<Arc<dyn MergeProposal>>,
    /// Tags to publish alongside the branch.
    pub tags: Option<HashMap<String, RevisionId>>,
    /// Account to own the derived branch.
    pub derived_owner: Option<String>,
    /// Whether target branch maintainers may push to the source branch.
    pub allow_collaboration: bool,
    /// Publish up to this revision instead of the branch tip.
    pub stop_revision: Option<RevisionId>,
    /// Whether a proposal with no effective changes is acceptable.
    pub allow_empty: bool,
    /// Merge the proposal automatically once checks pass.
    pub auto_merge: bool,
    /// Open the proposal as a draft.
    pub work_in_progress: bool,
}

impl PublishRequest {
    /// Request with the defaults the batch layer uses.
    pub fn new(mode: Mode, name: impl Into<String>) -> Self {
        Self {
            mode,
            name: name.into(),
            allow_create_proposal: true,
            overwrite_existing: true,
            ..Self::default()
        }
    }
}

/// What a publication did.
pub struct PublishResult {
    /// The mode that actually ran (attempt-push reports push or propose).
    pub mode: Mode,
    /// URL of the branch the changes target.
    pub target_branch_url: Url,
    /// The created or updated proposal, for proposal modes.
    pub proposal: Option<Arc<dyn MergeProposal>>,
    /// Whether the proposal is new; `None` for push modes.
    pub is_new: Option<bool>,
}

impl std::fmt::Debug for PublishResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishResult")
            .field("mode", &self.mode)
            .field("target_branch_url", &self.target_branch_url)
            .field("proposal", &self.proposal.as_ref().map(|p| p.url()))
            .field("is_new", &self.is_new)
            .finish()
    }
}

/// Push the local branch out as a derived branch of `main_branch`.
pub async fn push_derived_changes(
    local_branch: &dyn Branch,
    main_branch: &dyn Branch,
    forge: &dyn Forge,
    name: &str,
    overwrite_existing: bool,
    owner: Option<&str>,
    tags: Option<&HashMap<String, RevisionId>>,
    stop_revision: Option<&RevisionId>,
) -> Result<(Arc<dyn Branch>, Url)> {
    let selector = tag_selector(tags);
    forge
        .publish_derived(
            local_branch,
            main_branch,
            name,
            overwrite_existing,
            owner,
            stop_revision,
            Some(&*selector),
        )
        .await
}

/// Fast-forward push of the local branch, and each changed colocated
/// branch, onto an already-open target.
pub async fn push_result(
    local_branch: &dyn Branch,
    remote_branch: &dyn Branch,
    additional_colocated_branches: &[(String, String)],
    tags: Option<&HashMap<String, RevisionId>>,
    stop_revision: Option<&RevisionId>,
) -> Result<()> {
    let selector = tag_selector(tags);
    local_branch
        .push(remote_branch, false, stop_revision, Some(&*selector))
        .await?;
    for (from_name, to_name) in additional_colocated_branches {
        match local_branch.open_colocated(from_name).await {
            Ok(branch) => {
                let target = remote_branch.colocated_for_push(to_name).await?;
                branch
                    .push(target.as_ref(), false, None, Some(&*selector))
                    .await?;
            }
            Err(Error::NotBranch(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Push the local branch to `main_branch`, going through the forge's
/// authenticated push URL when a forge is known.
pub async fn push_changes(
    vcs: &dyn Vcs,
    local_branch: &dyn Branch,
    main_branch: &dyn Branch,
    forge: Option<&dyn Forge>,
    additional_colocated_branches: &[(String, String)],
    tags: Option<&HashMap<String, RevisionId>>,
    stop_revision: Option<&RevisionId>,
) -> Result<()> {
    let push_url = match forge {
        Some(forge) => forge.get_push_url(main_branch).await?,
        None => main_branch.url(),
    };
    tracing::info!("pushing to {}", main_branch.url());
    let target = vcs
        .open_branch(&push_url, main_branch.name().as_deref())
        .await?;
    push_result(
        local_branch,
        target.as_ref(),
        additional_colocated_branches,
        tags,
        stop_revision,
    )
    .await
}

/// Look for an earlier run's derived branch called `name`, and any
/// proposals attached to it.
///
/// Returns `(resume_branch, overwrite_existing, open_proposals)`: the
/// branch to continue from; whether an existing branch should be
/// overwritten (a merged or unrelated leftover); and the open proposals to
/// update.
pub async fn find_existing_proposed(
    main_branch: &dyn Branch,
    forge: &dyn Forge,
    name: &str,
    overwrite_unrelated: bool,
    owner: Option<&str>,
) -> Result<(
    Option<Arc<dyn Branch>>,
    Option<bool>,
    Option<Vec<Arc<dyn MergeProposal>>>,
)> {
    let existing_branch = match forge.get_derived_branch(main_branch, name, owner).await {
        Ok(branch) => branch,
        Err(Error::NotBranch(_)) => return Ok((None, None, None)),
        Err(e) => return Err(e),
    };

    tracing::info!(
        "branch {} already exists (branch at {})",
        name,
        existing_branch.url()
    );

    let mut open_proposals = vec![];
    let mut finished_proposals = vec![];
    for mp in forge
        .iter_proposals(existing_branch.as_ref(), main_branch, ProposalStatus::All)
        .await?
    {
        if !mp.is_closed().await? && !mp.is_merged().await? {
            open_proposals.push(mp);
        } else {
            finished_proposals.push(mp);
        }
    }
    if !open_proposals.is_empty() {
        Ok((Some(existing_branch), Some(false), Some(open_proposals)))
    } else if let Some(first) = finished_proposals.first() {
        tracing::info!(
            "there is a proposal that has already been merged at {}",
            first.url()
        );
        Ok((None, Some(true), None))
    } else if overwrite_unrelated {
        // An existing branch with no proposals at all, perhaps made for a
        // different target branch.
        Ok((None, Some(true), None))
    } else {
        Ok((None, Some(false), None))
    }
}

/// Whether merging the local branch into `main_branch` would change
/// nothing.
///
/// The local branch's own commits don't decide this: a commit whose
/// content the target already has merges to an empty diff. Unrelated
/// histories are treated as carrying changes.
pub async fn check_proposal_diff_empty(
    local_branch: &dyn Branch,
    main_branch: &dyn Branch,
    stop_revision: Option<&RevisionId>,
) -> Result<bool> {
    let stop_revision = match stop_revision {
        Some(rev) => rev.clone(),
        None => local_branch.last_revision().await?,
    };
    let main_revid = main_branch.last_revision().await?;
    let repository = local_branch.repository();
    repository
        .fetch(main_branch.repository().as_ref(), &main_revid)
        .await?;

    let base = match repository.common_ancestor(&stop_revision, &main_revid).await? {
        Some(base) => base,
        None => return Ok(false),
    };
    let base_tree = repository.revision_tree(&base).await?;
    let stop_tree = repository.revision_tree(&stop_revision).await?;
    let main_tree = repository.revision_tree(&main_revid).await?;

    for change in base_tree.diff(&stop_tree) {
        let effective = main_tree.get(&change.path) != change.new.as_deref();
        if effective {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Create a merge proposal, or bring an existing one up to date.
///
/// Returns the proposal and whether it is new.
#[allow(clippy::too_many_lines)]
pub async fn propose_changes(
    local_branch: &dyn Branch,
    main_branch: &dyn Branch,
    forge: &dyn Forge,
    resume_branch: Option<&dyn Branch>,
    content: &dyn ProposalContent,
    request: &PublishRequest,
    additional_colocated_branches: &[(String, String)],
) -> Result<(Arc<dyn MergeProposal>, bool)> {
    let stop_revision = match &request.stop_revision {
        Some(rev) => rev.clone(),
        None => local_branch.last_revision().await?,
    };
    if !request.allow_empty
        && check_proposal_diff_empty(local_branch, main_branch, Some(&stop_revision)).await?
    {
        return Err(Error::EmptyMergeProposal);
    }
    let selector = tag_selector(request.tags.as_ref());

    let derived;
    let remote_branch: &dyn Branch = if let Some(resume) = resume_branch {
        local_branch
            .push(
                resume,
                request.overwrite_existing,
                Some(&stop_revision),
                Some(&*selector),
            )
            .await?;
        resume
    } else {
        let (branch, _public_url) = forge
            .publish_derived(
                local_branch,
                main_branch,
                &request.name,
                request.overwrite_existing,
                request.derived_owner.as_deref(),
                Some(&stop_revision),
                Some(&*selector),
            )
            .await?;
        derived = branch;
        derived.as_ref()
    };

    for (from_name, to_name) in additional_colocated_branches {
        match local_branch.open_colocated(from_name).await {
            Ok(branch) => {
                let target = remote_branch.colocated_for_push(to_name).await?;
                branch
                    .push(
                        target.as_ref(),
                        request.overwrite_existing,
                        None,
                        Some(&*selector),
                    )
                    .await?;
            }
            Err(Error::NotBranch(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let mut resume_proposal = request.existing_proposal.clone();
    if let Some(mp) = resume_proposal.as_ref() {
        if mp.is_closed().await? {
            if let Err(e) = mp.reopen().await {
                tracing::info!(
                    "reopening existing proposal failed ({}), creating a new proposal",
                    e
                );
                resume_proposal = None;
            }
        }
    }

    // Only resumed runs fold existing proposal text into the new content.
    let existing_snapshot = if resume_branch.is_some() {
        match resume_proposal.as_ref() {
            Some(mp) => Some(snapshot_proposal(mp.as_ref()).await?),
            None => None,
        }
    } else {
        None
    };
    let description = content.description(
        forge.merge_proposal_description_format(),
        existing_snapshot.as_ref(),
    );
    let commit_message = content.commit_message(existing_snapshot.as_ref());
    let title = content
        .title(existing_snapshot.as_ref())
        .or_else(|| determine_title(&description));

    if let Some(proposal) = resume_proposal {
        // Setting text that hasn't changed makes some forges notify
        // subscribers, so every update is compared first.
        if proposal.get_description().await?.as_deref() != Some(description.as_str()) {
            match proposal.set_description(&description).await {
                Ok(()) | Err(Error::UnsupportedOperation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        // A rendering that yields no text keeps whatever the proposal
        // already carries; only a differing replacement is written.
        if let Some(message) = commit_message.as_deref() {
            if proposal.get_commit_message().await?.as_deref() != Some(message) {
                match proposal.set_commit_message(message).await {
                    Ok(()) | Err(Error::UnsupportedOperation(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        if let Some(title) = title.as_deref() {
            if proposal.get_title().await?.as_deref() != Some(title) {
                match proposal.set_title(title).await {
                    Ok(()) | Err(Error::UnsupportedOperation(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        return Ok((proposal, false));
    }

    let proposal_request = ProposalRequest {
        description,
        title: if forge.supports_merge_proposal_title() {
            title
        } else {
            None
        },
        commit_message: if forge.supports_merge_proposal_commit_message() {
            commit_message
        } else {
            None
        },
        labels: request.labels.clone(),
        reviewers: request.reviewers.clone(),
        allow_collaboration: request.allow_collaboration,
        work_in_progress: request.work_in_progress,
    };
    let proposal = match forge
        .create_proposal(remote_branch, main_branch, &proposal_request)
        .await
    {
        Ok(mp) => mp,
        Err(Error::ProposalExists(url)) => {
            // Someone (possibly a concurrent run) created it first; adopt
            // theirs instead of failing.
            tracing::info!("proposal already exists at {}, adopting it", url);
            let open = forge
                .iter_proposals(remote_branch, main_branch, ProposalStatus::Open)
                .await?;
            match open.into_iter().find(|mp| mp.url() == url) {
                Some(mp) => return Ok((mp, false)),
                None => return Err(Error::ProposalExists(url)),
            }
        }
        Err(e @ Error::PermissionDenied(_)) => {
            tracing::info!("permission denied while trying to create proposal");
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if request.auto_merge {
        proposal.merge(true).await?;
    }
    Ok((proposal, true))
}

/// Publish a set of changes according to `request`.
pub async fn publish_changes(
    vcs: &dyn Vcs,
    local_branch: &dyn Branch,
    main_branch: &dyn Branch,
    resume_branch: Option<&dyn Branch>,
    forge: Option<Arc<dyn Forge>>,
    content: &dyn ProposalContent,
    request: &PublishRequest,
    additional_colocated_branches: &[(String, String)],
) -> Result<PublishResult> {
    let mut mode = request.mode;
    let stop_revision = match &request.stop_revision {
        Some(rev) => rev.clone(),
        None => local_branch.last_revision().await?,
    };
    let main_revision = main_branch.last_revision().await?;

    if stop_revision == main_revision {
        // The target caught up with everything this run would publish.
        if let Some(proposal) = request.existing_proposal.as_ref() {
            tracing::info!("closing existing merge proposal - no new revisions");
            proposal.close().await?;
        }
        return Ok(PublishResult {
            mode,
            target_branch_url: main_branch.url(),
            proposal: request.existing_proposal.clone(),
            is_new: Some(false),
        });
    }

    if let Some(resume) = resume_branch {
        if resume.last_revision().await? == stop_revision {
            // No new revisions this iteration, but still ahead of main; the
            // previous run may not have gotten around to the proposal.
            tracing::info!("no changes added; making sure merge proposal is up to date");
        }
    }

    // Push mode is the only one that can do without a forge.
    let forge = match forge {
        Some(forge) => Some(forge),
        None => match determine_forge(&main_branch.url()).await {
            Ok(forge) => Some(forge),
            Err(Error::UnsupportedForge(url)) if mode == Mode::Push => {
                tracing::warn!("unsupported forge, pushing directly to {}", url);
                None
            }
            Err(e) => return Err(e),
        },
    };

    match mode {
        Mode::PushDerived => {
            let forge = forge
                .clone()
                .ok_or_else(|| Error::UnsupportedForge(main_branch.url()))?;
            push_derived_changes(
                local_branch,
                main_branch,
                forge.as_ref(),
                &request.name,
                request.overwrite_existing,
                request.derived_owner.as_deref(),
                request.tags.as_ref(),
                Some(&stop_revision),
            )
            .await?;
            return Ok(PublishResult {
                mode,
                target_branch_url: main_branch.url(),
                proposal: None,
                is_new: None,
            });
        }
        Mode::Push | Mode::AttemptPush => {
            // A direct push may never discard target history.
            let repository = local_branch.repository();
            repository
                .fetch(main_branch.repository().as_ref(), &main_revision)
                .await?;
            if !repository
                .is_ancestor(&main_revision, &stop_revision)
                .await?
            {
                return Err(Error::Diverged);
            }
            match push_changes(
                vcs,
                local_branch,
                main_branch,
                forge.as_deref(),
                additional_colocated_branches,
                request.tags.as_ref(),
                Some(&stop_revision),
            )
            .await
            {
                Ok(()) => {
                    return Ok(PublishResult {
                        mode,
                        target_branch_url: main_branch.url(),
                        proposal: None,
                        is_new: None,
                    });
                }
                Err(Error::PermissionDenied(msg)) => {
                    if mode == Mode::AttemptPush {
                        tracing::info!("push access denied, falling back to propose");
                        mode = Mode::Propose;
                    } else {
                        tracing::info!("permission denied during push");
                        return Err(Error::PermissionDenied(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Mode::Propose => {}
    }

    if resume_branch.is_none() && !request.allow_create_proposal {
        return Err(Error::InsufficientChangesForNewProposal);
    }

    let forge = forge.ok_or_else(|| Error::UnsupportedForge(main_branch.url()))?;
    let mut propose_request = request.clone();
    propose_request.stop_revision = Some(stop_revision);
    let (proposal, is_new) = propose_changes(
        local_branch,
        main_branch,
        forge.as_ref(),
        resume_branch,
        content,
        &propose_request,
        additional_colocated_branches,
    )
    .await?;
    Ok(PublishResult {
        mode,
        target_branch_url: main_branch.url(),
        proposal: Some(proposal),
        is_new: Some(is_new),
    })
}
