//! Hosting-site abstraction.
//!
//! A [`Forge`] wraps one code-hosting service account: it can materialize
//! derived branches under the right ownership, enumerate merge proposals
//! between branch pairs, and create new ones. The publish logic is written
//! entirely against these traits; the GitHub implementation lives in
//! [`github`].

pub mod github;

use crate::error::{Error, Result};
use crate::vcs::{Branch, TagSelector};
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

/// The markup dialect a forge renders proposal descriptions in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescriptionFormat {
    /// GitHub-style markdown.
    #[default]
    Markdown,
    /// Plain text.
    Plain,
}

impl std::fmt::Display for DescriptionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Markdown => write!(f, "markdown"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

impl std::str::FromStr for DescriptionFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(Self::Markdown),
            "plain" => Ok(Self::Plain),
            _ => Err(format!("unknown description format: {}", s)),
        }
    }
}

/// Which proposals to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    /// Still open.
    Open,
    /// Closed without merging.
    Closed,
    /// Merged.
    Merged,
    /// Any state.
    All,
}

/// Everything a new proposal is created with.
#[derive(Debug, Clone, Default)]
pub struct ProposalRequest {
    /// Body text, in the forge's description format.
    pub description: String,
    /// Title; forges that don't support titles ignore it.
    pub title: Option<String>,
    /// Commit message for the eventual merge commit, where supported.
    pub commit_message: Option<String>,
    /// Labels to attach.
    pub labels: Vec<String>,
    /// Reviewers to request.
    pub reviewers: Vec<String>,
    /// Whether maintainers may push to the source branch.
    pub allow_collaboration: bool,
    /// Open as a draft.
    pub work_in_progress: bool,
}

/// An existing merge proposal on a forge.
#[async_trait]
pub trait MergeProposal: Send + Sync {
    /// Web URL of the proposal.
    fn url(&self) -> Url;

    /// Current body text.
    async fn get_description(&self) -> Result<Option<String>>;

    /// Replace the body text.
    async fn set_description(&self, description: &str) -> Result<()>;

    /// Current merge commit message, where the forge has one.
    async fn get_commit_message(&self) -> Result<Option<String>>;

    /// Replace the merge commit message.
    async fn set_commit_message(&self, message: &str) -> Result<()>;

    /// Current title.
    async fn get_title(&self) -> Result<Option<String>>;

    /// Replace the title.
    async fn set_title(&self, title: &str) -> Result<()>;

    /// Whether the proposal was closed without merging.
    async fn is_closed(&self) -> Result<bool>;

    /// Whether the proposal was merged.
    async fn is_merged(&self) -> Result<bool>;

    /// Close the proposal.
    async fn close(&self) -> Result<()>;

    /// Reopen a closed proposal.
    ///
    /// Forges that cannot reopen fail with [`Error::UnsupportedOperation`];
    /// the publish logic then creates a fresh proposal instead.
    async fn reopen(&self) -> Result<()>;

    /// Enable automatic merge once checks pass, where supported.
    async fn merge(&self, auto: bool) -> Result<()>;
}

/// One code-hosting service, bound to an authenticated account.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Short service label ("github").
    fn forge_name(&self) -> &'static str;

    /// Markup dialect for proposal descriptions.
    fn merge_proposal_description_format(&self) -> DescriptionFormat;

    /// Whether proposals carry a separate merge commit message.
    fn supports_merge_proposal_commit_message(&self) -> bool;

    /// Whether proposals carry a title distinct from the description.
    fn supports_merge_proposal_title(&self) -> bool;

    /// A URL the authenticated account can push `branch` through.
    async fn get_push_url(&self, branch: &dyn Branch) -> Result<Url>;

    /// Open the derived branch called `name` for `main_branch`, under
    /// `owner` (the authenticated account when absent). Fails with
    /// [`Error::NotBranch`] when it doesn't exist yet.
    async fn get_derived_branch(
        &self,
        main_branch: &dyn Branch,
        name: &str,
        owner: Option<&str>,
    ) -> Result<Arc<dyn Branch>>;

    /// Push `local_branch` out as the derived branch `name` of
    /// `main_branch`, creating whatever container the forge needs (a fork,
    /// typically). Returns the published branch and its public URL.
    async fn publish_derived(
        &self,
        local_branch: &dyn Branch,
        main_branch: &dyn Branch,
        name: &str,
        overwrite_existing: bool,
        owner: Option<&str>,
        stop_revision: Option<&crate::types::RevisionId>,
        tag_selector: Option<&TagSelector>,
    ) -> Result<(Arc<dyn Branch>, Url)>;

    /// Enumerate proposals from `source` into `target` with the given
    /// status.
    async fn iter_proposals(
        &self,
        source: &dyn Branch,
        target: &dyn Branch,
        status: ProposalStatus,
    ) -> Result<Vec<Arc<dyn MergeProposal>>>;

    /// Create a proposal merging `source` into `target`.
    ///
    /// Fails with [`Error::ProposalExists`] carrying the URL of the
    /// existing proposal when the forge already has one for this pair.
    async fn create_proposal(
        &self,
        source: &dyn Branch,
        target: &dyn Branch,
        request: &ProposalRequest,
    ) -> Result<Arc<dyn MergeProposal>>;
}

/// Find the forge responsible for a branch URL.
///
/// Only GitHub (github.com, or the host named by `GH_HOST`) is recognized;
/// anything else fails with [`Error::UnsupportedForge`], which push-mode
/// callers tolerate.
pub async fn determine_forge(url: &Url) -> Result<Arc<dyn Forge>> {
    let host = url.host_str().ok_or_else(|| {
        Error::UnsupportedForge(url.clone())
    })?;
    let github_host = std::env::var("GH_HOST").unwrap_or_else(|_| "github.com".to_string());
    if host == github_host || host == format!("www.{}", github_host) {
        let forge = github::GitHubForge::from_env().await?;
        return Ok(Arc::new(forge));
    }
    Err(Error::UnsupportedForge(url.clone()))
}
