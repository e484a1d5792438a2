//! Mock forge for testing
//!
//! These are test utilities - not all may be used in current tests but are
//! available for future test development.

#![allow(dead_code)]

use async_trait::async_trait;
use autoprop::error::{Error, Result};
use autoprop::forge::{
    DescriptionFormat, Forge, MergeProposal, ProposalRequest, ProposalStatus,
};
use autoprop::types::RevisionId;
use autoprop::vcs::{Branch, MemoryVcs, TagSelector};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

/// Mutable fields of a mock proposal.
#[derive(Debug, Default)]
pub struct ProposalState {
    pub description: Option<String>,
    pub commit_message: Option<String>,
    pub title: Option<String>,
    pub closed: bool,
    pub merged: bool,
}

/// A merge proposal held entirely in memory, with call tracking.
pub struct MockProposal {
    url: Url,
    source: Url,
    target: Url,
    pub state: Mutex<ProposalState>,
    pub set_description_calls: AtomicU64,
    pub set_title_calls: AtomicU64,
    pub close_calls: AtomicU64,
    pub reopen_calls: AtomicU64,
    pub merge_calls: AtomicU64,
    fail_reopen: AtomicBool,
}

impl MockProposal {
    fn new(number: u64, source: Url, target: Url, state: ProposalState) -> Self {
        let url = Url::parse(&format!("https://forge.example/proposals/{number}")).unwrap();
        Self {
            url,
            source,
            target,
            state: Mutex::new(state),
            set_description_calls: AtomicU64::new(0),
            set_title_calls: AtomicU64::new(0),
            close_calls: AtomicU64::new(0),
            reopen_calls: AtomicU64::new(0),
            merge_calls: AtomicU64::new(0),
            fail_reopen: AtomicBool::new(false),
        }
    }

    /// Make `reopen` fail, as forges that cannot reopen do.
    pub fn fail_reopen(&self) {
        self.fail_reopen.store(true, Ordering::SeqCst);
    }

    /// Mark the proposal closed without going through the API.
    pub fn force_closed(&self) {
        self.state.lock().unwrap().closed = true;
    }

    /// Mark the proposal merged without going through the API.
    pub fn force_merged(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.merged = true;
    }
}

#[async_trait]
impl MergeProposal for MockProposal {
    fn url(&self) -> Url {
        self.url.clone()
    }

    async fn get_description(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().description.clone())
    }

    async fn set_description(&self, description: &str) -> Result<()> {
        self.set_description_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().description = Some(description.to_string());
        Ok(())
    }

    async fn get_commit_message(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().commit_message.clone())
    }

    async fn set_commit_message(&self, _message: &str) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "commit messages are not supported".to_string(),
        ))
    }

    async fn get_title(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().title.clone())
    }

    async fn set_title(&self, title: &str) -> Result<()> {
        self.set_title_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().title = Some(title.to_string());
        Ok(())
    }

    async fn is_closed(&self) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.closed && !state.merged)
    }

    async fn is_merged(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().merged)
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    async fn reopen(&self) -> Result<()> {
        self.reopen_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reopen.load(Ordering::SeqCst) {
            return Err(Error::UnsupportedOperation(
                "reopening is not supported".to_string(),
            ));
        }
        self.state.lock().unwrap().closed = false;
        Ok(())
    }

    async fn merge(&self, _auto: bool) -> Result<()> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.merged = true;
        Ok(())
    }
}

/// Call record for `create_proposal`
#[derive(Debug, Clone)]
pub struct CreateProposalCall {
    pub source: Url,
    pub target: Url,
    pub description: String,
    pub title: Option<String>,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
}

/// In-memory forge over a [`MemoryVcs`].
///
/// Derived branches become real in-memory repositories under
/// `mem://forge/...`, so the publish logic exercises the same branch pushes
/// it would against a live service.
///
/// Features:
/// - Call tracking for verification
/// - Error injection for failure path testing
pub struct MockForge {
    vcs: MemoryVcs,
    proposals: Mutex<Vec<Arc<MockProposal>>>,
    next_number: AtomicU64,
    deny_push: AtomicBool,
    create_calls: Mutex<Vec<CreateProposalCall>>,
    publish_derived_calls: AtomicU64,
}

impl MockForge {
    /// Create a forge sharing `vcs` with the test.
    pub fn new(vcs: MemoryVcs) -> Self {
        Self {
            vcs,
            proposals: Mutex::new(Vec::new()),
            next_number: AtomicU64::new(1),
            deny_push: AtomicBool::new(false),
            create_calls: Mutex::new(Vec::new()),
            publish_derived_calls: AtomicU64::new(0),
        }
    }

    /// Make direct pushes fail with permission denied.
    pub fn deny_push(&self) {
        self.deny_push.store(true, Ordering::SeqCst);
    }

    /// The URL the forge gives the derived branch `name` under `owner`.
    pub fn derived_url(&self, name: &str, owner: Option<&str>) -> Url {
        Url::parse(&format!(
            "mem://forge/{}/{}",
            owner.unwrap_or("self"),
            name
        ))
        .unwrap()
    }

    /// Register an open proposal from `source` into `target`.
    pub fn add_open_proposal(
        &self,
        source: &Url,
        target: &Url,
        description: &str,
    ) -> Arc<MockProposal> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let proposal = Arc::new(MockProposal::new(
            number,
            source.clone(),
            target.clone(),
            ProposalState {
                description: Some(description.to_string()),
                ..ProposalState::default()
            },
        ));
        self.proposals.lock().unwrap().push(proposal.clone());
        proposal
    }

    /// All proposals the forge holds, in creation order.
    pub fn proposals(&self) -> Vec<Arc<MockProposal>> {
        self.proposals.lock().unwrap().clone()
    }

    /// All recorded `create_proposal` calls.
    pub fn create_calls(&self) -> Vec<CreateProposalCall> {
        self.create_calls.lock().unwrap().clone()
    }

    /// Number of `publish_derived` calls.
    pub fn publish_derived_count(&self) -> u64 {
        self.publish_derived_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Forge for MockForge {
    fn forge_name(&self) -> &'static str {
        "mock"
    }

    fn merge_proposal_description_format(&self) -> DescriptionFormat {
        DescriptionFormat::Markdown
    }

    fn supports_merge_proposal_commit_message(&self) -> bool {
        false
    }

    fn supports_merge_proposal_title(&self) -> bool {
        true
    }

    async fn get_push_url(&self, branch: &dyn Branch) -> Result<Url> {
        if self.deny_push.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied(
                "push access denied".to_string(),
            ));
        }
        Ok(branch.url())
    }

    async fn get_derived_branch(
        &self,
        _main_branch: &dyn Branch,
        name: &str,
        owner: Option<&str>,
    ) -> Result<Arc<dyn Branch>> {
        let url = self.derived_url(name, owner);
        match self.vcs.get_repo(&url) {
            Some(repo) => Ok(Arc::new(repo.branch(""))),
            None => Err(Error::NotBranch(url)),
        }
    }

    async fn publish_derived(
        &self,
        local_branch: &dyn Branch,
        _main_branch: &dyn Branch,
        name: &str,
        overwrite_existing: bool,
        owner: Option<&str>,
        stop_revision: Option<&RevisionId>,
        tag_selector: Option<&TagSelector>,
    ) -> Result<(Arc<dyn Branch>, Url)> {
        self.publish_derived_calls.fetch_add(1, Ordering::SeqCst);
        let url = self.derived_url(name, owner);
        let repo = self.vcs.create_repo(url.as_str());
        let target = repo.branch("");
        local_branch
            .push(&target, overwrite_existing, stop_revision, tag_selector)
            .await?;
        Ok((Arc::new(target), url))
    }

    async fn iter_proposals(
        &self,
        source: &dyn Branch,
        target: &dyn Branch,
        status: ProposalStatus,
    ) -> Result<Vec<Arc<dyn MergeProposal>>> {
        let source_url = source.url();
        let target_url = target.url();
        let mut matching: Vec<Arc<dyn MergeProposal>> = Vec::new();
        for proposal in self.proposals.lock().unwrap().iter() {
            if proposal.source != source_url || proposal.target != target_url {
                continue;
            }
            let state = {
                let s = proposal.state.lock().unwrap();
                (s.closed, s.merged)
            };
            let keep = match status {
                ProposalStatus::All => true,
                ProposalStatus::Open => !state.0 && !state.1,
                ProposalStatus::Closed => state.0 && !state.1,
                ProposalStatus::Merged => state.1,
            };
            if keep {
                matching.push(proposal.clone());
            }
        }
        Ok(matching)
    }

    async fn create_proposal(
        &self,
        source: &dyn Branch,
        target: &dyn Branch,
        request: &ProposalRequest,
    ) -> Result<Arc<dyn MergeProposal>> {
        let source_url = source.url();
        let target_url = target.url();
        self.create_calls.lock().unwrap().push(CreateProposalCall {
            source: source_url.clone(),
            target: target_url.clone(),
            description: request.description.clone(),
            title: request.title.clone(),
            labels: request.labels.clone(),
            reviewers: request.reviewers.clone(),
        });
        let existing = self
            .iter_proposals(source, target, ProposalStatus::Open)
            .await?;
        if let Some(first) = existing.first() {
            return Err(Error::ProposalExists(first.url()));
        }
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let proposal = Arc::new(MockProposal::new(
            number,
            source_url,
            target_url,
            ProposalState {
                description: Some(request.description.clone()),
                commit_message: request.commit_message.clone(),
                title: request.title.clone(),
                ..ProposalState::default()
            },
        ));
        self.proposals.lock().unwrap().push(proposal.clone());
        Ok(proposal)
    }
}
