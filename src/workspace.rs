//! Workspace reconciliation.
//!
//! A [`Workspace`] owns a disposable local tree sprouted from the cheapest
//! available source (cache, then the branch of a previous run, then the
//! main branch) and reconciles it so that local history extends the main
//! branch. When the branch of a previous run has been invalidated by new
//! main-branch history, the workspace resets to main and records that it
//! did so, so callers know earlier work was thrown away.

use crate::codemod::{ChangeOutcome, ChangeProducer};
use crate::error::{Error, Result};
use crate::forge::{Forge, MergeProposal};
use crate::publish::{
    self, ProposalContent, PublishRequest, PublishResult,
};
use crate::types::RevisionId;
use crate::vcs::{write_diff, Branch, LocalTree, Tree, Vcs};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

async fn fetch_colocated(
    tree: &dyn LocalTree,
    source: &dyn Branch,
    mapping: &HashMap<String, String>,
    overwrite: bool,
) -> Result<()> {
    tracing::debug!("fetching colocated branches: {:?}", mapping);
    for (from_name, to_name) in mapping {
        match tree
            .fetch_colocated(source, from_name, to_name, overwrite)
            .await
        {
            Ok(()) => {
                tracing::debug!("fetched colocated branch {} -> {}", from_name, to_name);
            }
            Err(Error::NotBranch(_)) => continue,
            Err(e) => {
                tracing::warn!(
                    "failed to fetch colocated branch {} -> {}: {}",
                    from_name,
                    to_name,
                    e
                );
            }
        }
    }
    Ok(())
}

/// Builder for a [`Workspace`].
#[derive(Default)]
pub struct WorkspaceBuilder {
    main_branch: Option<Arc<dyn Branch>>,
    resume_branch: Option<Arc<dyn Branch>>,
    cached_branch: Option<Arc<dyn Branch>>,
    additional_colocated_branches: HashMap<String, String>,
    resume_branch_additional_colocated_branches: HashMap<String, String>,
}

impl WorkspaceBuilder {
    /// The branch changes are ultimately destined for.
    pub fn main_branch(mut self, branch: Arc<dyn Branch>) -> Self {
        self.main_branch = Some(branch);
        self
    }

    /// A branch left behind by a previous run, to resume from.
    pub fn resume_branch(mut self, branch: Arc<dyn Branch>) -> Self {
        self.resume_branch = Some(branch);
        self
    }

    /// A local mirror to sprout from instead of the main branch.
    pub fn cached_branch(mut self, branch: Arc<dyn Branch>) -> Self {
        self.cached_branch = Some(branch);
        self
    }

    /// Colocated branches to carry along (main-branch name to local name).
    pub fn additional_colocated_branches(mut self, branches: HashMap<String, String>) -> Self {
        self.additional_colocated_branches = branches;
        self
    }

    /// Colocated branches the previous run published (resume name to local
    /// name). These take precedence over the main branch's versions.
    pub fn resume_branch_additional_colocated_branches(
        mut self,
        branches: HashMap<String, String>,
    ) -> Self {
        self.resume_branch_additional_colocated_branches = branches;
        self
    }

    /// Sprout and reconcile the workspace.
    pub async fn build(self, vcs: Arc<dyn Vcs>) -> Result<Workspace> {
        let main_branch = self.main_branch;
        let mut resume_branch = self.resume_branch;
        let cached_branch = self.cached_branch;
        let mut additional_colocated_branches = self.additional_colocated_branches;
        let mut resume_colocated = self.resume_branch_additional_colocated_branches;

        // Sprout from the most efficient source.
        let (sprout_base, sprout_coloc) = if let Some(cached) = cached_branch.as_ref() {
            (Some(cached.clone()), &additional_colocated_branches)
        } else if let Some(resume) = resume_branch.as_ref() {
            (Some(resume.clone()), &resume_colocated)
        } else {
            (main_branch.clone(), &additional_colocated_branches)
        };

        let local_tree = if let Some(base) = sprout_base {
            tracing::debug!("creating sprout from {}", base.url());
            vcs.sprout(base.as_ref(), sprout_coloc).await?
        } else {
            tracing::debug!("creating new empty tree");
            vcs.create_empty().await?
        };

        let mut main_colo_revid = HashMap::new();
        let mut main_branch_revid = None;
        let mut refreshed = false;

        if let Some(main) = main_branch.as_ref() {
            // Snapshot the main tip and the colocated tips now; change
            // queries compare against these even if the remote advances
            // while the run is underway.
            main_branch_revid = Some(main.last_revision().await?);
            for from_name in additional_colocated_branches.keys() {
                match main.open_colocated(from_name).await {
                    Ok(branch) => {
                        main_colo_revid
                            .insert(from_name.clone(), branch.last_revision().await?);
                    }
                    Err(Error::NotBranch(_)) => {}
                    Err(e) => {
                        tracing::warn!(
                            "failed to open colocated branch {}: {}",
                            from_name,
                            e
                        );
                    }
                }
            }

            if cached_branch.is_some() {
                // The cache may lag; bring in whatever it was missing.
                let from_branch = resume_branch.as_ref().unwrap_or(main);
                tracing::debug!(
                    "pulling in missing revisions from {}",
                    from_branch.url()
                );
                local_tree.pull(from_branch.as_ref(), true).await?;
            }

            // The local tree now sits on the resume branch tip, or on main.
            if let Some(resume) = resume_branch.clone() {
                // Earlier work is only kept when it still extends main.
                tracing::debug!("pulling in missing revisions from {}", main.url());
                match local_tree.pull(main.as_ref(), false).await {
                    Err(Error::Diverged) => {
                        tracing::info!("restarting branch");
                        refreshed = true;
                        resume_branch = None;
                        resume_colocated.clear();
                        local_tree.pull(main.as_ref(), true).await?;
                        fetch_colocated(
                            local_tree.as_ref(),
                            main.as_ref(),
                            &additional_colocated_branches,
                            false,
                        )
                        .await?;
                    }
                    Ok(()) => {
                        fetch_colocated(
                            local_tree.as_ref(),
                            main.as_ref(),
                            &additional_colocated_branches,
                            false,
                        )
                        .await?;
                        if !resume_colocated.is_empty() {
                            // The previous run's colocated branches replace
                            // main's version of the same name.
                            fetch_colocated(
                                local_tree.as_ref(),
                                resume.as_ref(),
                                &resume_colocated,
                                true,
                            )
                            .await?;
                            additional_colocated_branches.extend(resume_colocated.drain());
                        }
                    }
                    Err(e) => {
                        tracing::warn!("failed to pull from main branch: {}", e);
                    }
                }
            } else {
                fetch_colocated(
                    local_tree.as_ref(),
                    main.as_ref(),
                    &additional_colocated_branches,
                    false,
                )
                .await?;
            }
        }

        let base_revid = local_tree.last_revision().await?;

        Ok(Workspace {
            vcs,
            main_branch,
            resume_branch,
            additional_colocated_branches,
            local_tree,
            base_revid,
            refreshed,
            main_branch_revid,
            main_colo_revid,
        })
    }
}

/// A place in which changes are prepared for publication.
pub struct Workspace {
    vcs: Arc<dyn Vcs>,
    main_branch: Option<Arc<dyn Branch>>,
    resume_branch: Option<Arc<dyn Branch>>,
    additional_colocated_branches: HashMap<String, String>,
    local_tree: Box<dyn LocalTree>,
    base_revid: RevisionId,
    refreshed: bool,
    main_branch_revid: Option<RevisionId>,
    main_colo_revid: HashMap<String, RevisionId>,
}

impl Workspace {
    /// Start building a workspace.
    pub fn builder() -> WorkspaceBuilder {
        WorkspaceBuilder::default()
    }

    /// Open the main branch at `url` and build a workspace on it.
    pub async fn from_url(url: &Url, vcs: Arc<dyn Vcs>) -> Result<Self> {
        let branch = vcs.open_branch(url, None).await?;
        Self::builder().main_branch(branch).build(vcs).await
    }

    /// The main branch, when one was given.
    pub fn main_branch(&self) -> Option<&Arc<dyn Branch>> {
        self.main_branch.as_ref()
    }

    /// The surviving resume branch; `None` after a refresh.
    pub fn resume_branch(&self) -> Option<&Arc<dyn Branch>> {
        self.resume_branch.as_ref()
    }

    /// The local tree changes are made in.
    pub fn local_tree(&self) -> &dyn LocalTree {
        self.local_tree.as_ref()
    }

    /// Whether earlier work was discarded and the tree reset to main.
    pub fn refreshed(&self) -> bool {
        self.refreshed
    }

    /// The run baseline: the local tip right after reconciliation.
    pub fn base_revid(&self) -> &RevisionId {
        &self.base_revid
    }

    /// The main branch tip captured at reconciliation time.
    pub fn main_branch_revid(&self) -> Option<&RevisionId> {
        self.main_branch_revid.as_ref()
    }

    /// Main-branch colocated tips captured at reconciliation time.
    pub fn main_colo_revid(&self) -> &HashMap<String, RevisionId> {
        &self.main_colo_revid
    }

    /// The colocated branch mapping in effect (main name to local name).
    pub fn additional_colocated_branches(&self) -> &HashMap<String, String> {
        &self.additional_colocated_branches
    }

    /// Run a change producer against the local tree.
    pub async fn run_changer(&self, changer: &dyn ChangeProducer) -> Result<ChangeOutcome> {
        changer.apply(self.local_tree.as_ref()).await
    }

    /// Whether the local branch differs from the main branch tip, as
    /// captured at reconciliation time.
    pub async fn changes_since_main(&self) -> Result<bool> {
        let local = self.local_tree.last_revision().await?;
        Ok(self.main_branch_revid.as_ref() != Some(&local))
    }

    /// Whether this run added commits on top of the baseline.
    pub async fn changes_since_base(&self) -> Result<bool> {
        Ok(self.base_revid != self.local_tree.last_revision().await?)
    }

    /// All branches that would be touched by publication: the primary
    /// branch first, then each colocated branch, as (name, main tip, local
    /// tip). A missing branch reads as `None`.
    pub async fn changed_branches(
        &self,
    ) -> Result<Vec<(String, Option<RevisionId>, Option<RevisionId>)>> {
        let main_revision = self.main_branch_revid.clone();
        let primary_name = self
            .main_branch
            .as_ref()
            .and_then(|b| b.name())
            .unwrap_or_default();
        let mut branches = vec![(
            primary_name,
            main_revision,
            Some(self.local_tree.last_revision().await?),
        )];
        for (from_name, to_name) in &self.additional_colocated_branches {
            let to_revision = self.local_tree.colocated_tip(to_name).await?;
            let from_revision = self.main_colo_revid.get(from_name).cloned();
            branches.push((from_name.clone(), from_revision, to_revision));
        }
        Ok(branches)
    }

    /// Whether any branch has changed relative to main.
    ///
    /// Includes changes already present in the resume branch; an absent
    /// branch counts as the null revision.
    pub async fn any_branch_changes(&self) -> Result<bool> {
        let normalize =
            |r: &Option<RevisionId>| r.clone().unwrap_or_else(RevisionId::null);
        Ok(self
            .changed_branches()
            .await?
            .iter()
            .any(|(_, from, to)| normalize(from) != normalize(to)))
    }

    /// Snapshot of the tree at the run baseline.
    pub async fn base_tree(&self) -> Result<Tree> {
        self.local_tree.revision_tree(&self.base_revid).await
    }

    /// Write the diff between the baseline and the committed local tree.
    pub async fn show_diff(
        &self,
        out: &mut dyn std::io::Write,
        old_label: Option<&str>,
        new_label: Option<&str>,
    ) -> Result<()> {
        let base_tree = self.base_tree().await?;
        let new_tree = self.local_tree.basis_tree().await?;
        write_diff(&base_tree, &new_tree, out, old_label, new_label)
    }

    /// Keep the on-disk copy alive past this workspace's lifetime.
    pub fn defer_destroy(&mut self) -> Option<PathBuf> {
        self.local_tree.defer_cleanup()
    }

    fn target_or_main<'a>(
        &'a self,
        target: Option<&'a dyn Branch>,
    ) -> Result<&'a dyn Branch> {
        match target {
            Some(branch) => Ok(branch),
            None => self
                .main_branch
                .as_deref()
                .ok_or(Error::NoTargetBranch),
        }
    }

    fn inverse_colocated(&self) -> Vec<(String, String)> {
        // Publication maps local names back to their main-branch names.
        self.additional_colocated_branches
            .iter()
            .map(|(from, to)| (to.clone(), from.clone()))
            .collect()
    }

    /// Publish the local changes according to `request`.
    pub async fn publish_changes(
        &self,
        target: Option<&dyn Branch>,
        forge: Option<Arc<dyn Forge>>,
        content: &dyn ProposalContent,
        request: &PublishRequest,
    ) -> Result<PublishResult> {
        let target = self.target_or_main(target)?;
        publish::publish_changes(
            self.vcs.as_ref(),
            self.local_tree.branch().as_ref(),
            target,
            self.resume_branch.as_deref(),
            forge,
            content,
            request,
            &self.inverse_colocated(),
        )
        .await
    }

    /// Create or update a merge proposal against the main branch.
    pub async fn propose(
        &self,
        target: Option<&dyn Branch>,
        forge: &dyn Forge,
        content: &dyn ProposalContent,
        request: &PublishRequest,
    ) -> Result<(Arc<dyn MergeProposal>, bool)> {
        let target = self.target_or_main(target)?;
        publish::propose_changes(
            self.local_tree.branch().as_ref(),
            target,
            forge,
            self.resume_branch.as_deref(),
            content,
            request,
            &self.inverse_colocated(),
        )
        .await
    }

    /// Push the local branch (and changed colocated branches) to main.
    pub async fn push(
        &self,
        forge: Option<&dyn Forge>,
        tags: Option<&HashMap<String, RevisionId>>,
    ) -> Result<()> {
        let target = self.target_or_main(None)?;
        publish::push_changes(
            self.vcs.as_ref(),
            self.local_tree.branch().as_ref(),
            target,
            forge,
            &self.inverse_colocated(),
            tags,
            None,
        )
        .await
    }

    /// Push only the given tags to the main branch.
    pub async fn push_tags(&self, tags: &HashMap<String, RevisionId>) -> Result<()> {
        self.push(None, Some(tags)).await
    }

    /// Push the local branch out as a derived branch of main.
    pub async fn push_derived(
        &self,
        target: Option<&dyn Branch>,
        forge: &dyn Forge,
        name: &str,
        overwrite_existing: bool,
        owner: Option<&str>,
        tags: Option<&HashMap<String, RevisionId>>,
    ) -> Result<(Arc<dyn Branch>, Url)> {
        let target = self.target_or_main(target)?;
        publish::push_derived_changes(
            self.local_tree.branch().as_ref(),
            target,
            forge,
            name,
            overwrite_existing,
            owner,
            tags,
            None,
        )
        .await
    }
}
