//! GitHub forge implementation using octocrab.

use crate::error::{Error, Result};
use crate::forge::{
    DescriptionFormat, Forge, MergeProposal, ProposalRequest, ProposalStatus,
};
use crate::vcs::{git, Branch, TagSelector};
use async_trait::async_trait;
use octocrab::Octocrab;
use std::sync::Arc;
use url::Url;

fn map_api_err(e: &octocrab::Error) -> Error {
    if let octocrab::Error::GitHub { source, .. } = e {
        if source.status_code.as_u16() == 403 {
            return Error::PermissionDenied(source.message.clone());
        }
    }
    Error::Forge(e.to_string())
}

/// Split a GitHub repository URL into (owner, repo).
fn owner_repo(url: &Url) -> Result<(String, String)> {
    let mut segments = url
        .path_segments()
        .ok_or_else(|| Error::Forge(format!("not a repository url: {}", url)))?;
    let owner = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Forge(format!("not a repository url: {}", url)))?;
    let repo = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Forge(format!("not a repository url: {}", url)))?;
    Ok((
        owner.to_string(),
        repo.trim_end_matches(".git").to_string(),
    ))
}

/// GitHub, bound to a personal access token.
pub struct GitHubForge {
    client: Octocrab,
    host: String,
    login: String,
    token: String,
}

impl GitHubForge {
    /// Build a forge from `GITHUB_TOKEN` (or `GH_TOKEN`), talking to
    /// github.com or the host named by `GH_HOST`.
    pub async fn from_env() -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .map_err(|_| Error::Forge("GITHUB_TOKEN is not set".to_string()))?;
        let host = std::env::var("GH_HOST").unwrap_or_else(|_| "github.com".to_string());
        let mut builder = Octocrab::builder().personal_token(token.clone());
        if host != "github.com" {
            builder = builder
                .base_uri(format!("https://{}/api/v3", host))
                .map_err(|e| Error::Forge(e.to_string()))?;
        }
        let client = builder.build().map_err(|e| Error::Forge(e.to_string()))?;
        let login = client
            .current()
            .user()
            .await
            .map_err(|e| map_api_err(&e))?
            .login;
        Ok(Self {
            client,
            host,
            login,
            token,
        })
    }

    fn repo_url(&self, owner: &str, repo: &str) -> Result<Url> {
        Url::parse(&format!("https://{}/{}/{}", self.host, owner, repo))
            .map_err(|e| Error::Forge(e.to_string()))
    }

    fn authenticated_url(&self, owner: &str, repo: &str) -> Result<Url> {
        Url::parse(&format!(
            "https://x-access-token:{}@{}/{}/{}.git",
            self.token, self.host, owner, repo
        ))
        .map_err(|e| Error::Forge(e.to_string()))
    }

    async fn default_branch(&self, owner: &str, repo: &str) -> Result<String> {
        let repository = self
            .client
            .repos(owner, repo)
            .get()
            .await
            .map_err(|e| map_api_err(&e))?;
        Ok(repository
            .default_branch
            .unwrap_or_else(|| "main".to_string()))
    }

    fn proposal(
        &self,
        owner: &str,
        repo: &str,
        pr: &octocrab::models::pulls::PullRequest,
    ) -> Result<Arc<dyn MergeProposal>> {
        let url = match pr.html_url.clone() {
            Some(url) => url,
            None => Url::parse(&format!(
                "https://{}/{}/{}/pull/{}",
                self.host, owner, repo, pr.number
            ))
            .map_err(|e| Error::Forge(e.to_string()))?,
        };
        Ok(Arc::new(GitHubProposal {
            client: self.client.clone(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            number: pr.number,
            html_url: url,
        }))
    }
}

#[async_trait]
impl Forge for GitHubForge {
    fn forge_name(&self) -> &'static str {
        "github"
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
        let (owner, repo) = owner_repo(&branch.url())?;
        self.authenticated_url(&owner, &repo)
    }

    async fn get_derived_branch(
        &self,
        main_branch: &dyn Branch,
        name: &str,
        owner: Option<&str>,
    ) -> Result<Arc<dyn Branch>> {
        let (_, repo) = owner_repo(&main_branch.url())?;
        let owner = owner.unwrap_or(&self.login);
        let fork_url = self.repo_url(owner, &repo)?;
        match self
            .client
            .repos(owner, &repo)
            .get_ref(&octocrab::params::repos::Reference::Branch(
                name.to_string(),
            ))
            .await
        {
            Ok(_) => Ok(git::remote_branch(fork_url, Some(name.to_string()))),
            Err(octocrab::Error::GitHub { source, .. })
                if source.status_code.as_u16() == 404 =>
            {
                Err(Error::NotBranch(fork_url))
            }
            Err(e) => Err(map_api_err(&e)),
        }
    }

    async fn publish_derived(
        &self,
        local_branch: &dyn Branch,
        main_branch: &dyn Branch,
        name: &str,
        overwrite_existing: bool,
        owner: Option<&str>,
        stop_revision: Option<&crate::types::RevisionId>,
        tag_selector: Option<&TagSelector>,
    ) -> Result<(Arc<dyn Branch>, Url)> {
        let (main_owner, repo) = owner_repo(&main_branch.url())?;
        let owner = owner.unwrap_or(&self.login).to_string();
        if owner != main_owner {
            // Forking is idempotent; an existing fork is simply returned.
            self.client
                .repos(&main_owner, &repo)
                .create_fork()
                .send()
                .await
                .map_err(|e| map_api_err(&e))?;
        }
        let push_url = self.authenticated_url(&owner, &repo)?;
        let target = git::remote_branch(push_url, Some(name.to_string()));
        local_branch
            .push(target.as_ref(), overwrite_existing, stop_revision, tag_selector)
            .await?;
        let public_url = self.repo_url(&owner, &repo)?;
        Ok((
            git::remote_branch(public_url.clone(), Some(name.to_string())),
            public_url,
        ))
    }

    async fn iter_proposals(
        &self,
        source: &dyn Branch,
        target: &dyn Branch,
        status: ProposalStatus,
    ) -> Result<Vec<Arc<dyn MergeProposal>>> {
        let (target_owner, target_repo) = owner_repo(&target.url())?;
        let (source_owner, _) = owner_repo(&source.url())?;
        let source_name = match source.name() {
            Some(name) => name,
            None => self.default_branch(&source_owner, &target_repo).await?,
        };
        let head = format!("{}:{}", source_owner, source_name);
        let state = match status {
            ProposalStatus::Open => octocrab::params::State::Open,
            ProposalStatus::Closed | ProposalStatus::Merged => octocrab::params::State::Closed,
            ProposalStatus::All => octocrab::params::State::All,
        };
        let page = self
            .client
            .pulls(&target_owner, &target_repo)
            .list()
            .head(head)
            .state(state)
            .per_page(100)
            .send()
            .await
            .map_err(|e| map_api_err(&e))?;
        let mut proposals = Vec::new();
        for pr in page.items {
            let merged = pr.merged_at.is_some();
            let keep = match status {
                ProposalStatus::Merged => merged,
                ProposalStatus::Closed => !merged,
                ProposalStatus::Open | ProposalStatus::All => true,
            };
            if keep {
                proposals.push(self.proposal(&target_owner, &target_repo, &pr)?);
            }
        }
        Ok(proposals)
    }

    async fn create_proposal(
        &self,
        source: &dyn Branch,
        target: &dyn Branch,
        request: &ProposalRequest,
    ) -> Result<Arc<dyn MergeProposal>> {
        let (target_owner, target_repo) = owner_repo(&target.url())?;
        let (source_owner, _) = owner_repo(&source.url())?;
        let source_name = source
            .name()
            .ok_or_else(|| Error::Forge("source branch has no name".to_string()))?;
        let head = format!("{}:{}", source_owner, source_name);
        let base = match target.name() {
            Some(name) => name,
            None => self.default_branch(&target_owner, &target_repo).await?,
        };
        let title = request
            .title
            .clone()
            .unwrap_or_else(|| source_name.clone());
        let created = self
            .client
            .pulls(&target_owner, &target_repo)
            .create(&title, &head, &base)
            .body(&request.description)
            .draft(request.work_in_progress)
            .maintainer_can_modify(request.allow_collaboration)
            .send()
            .await;
        let pr = match created {
            Ok(pr) => pr,
            Err(e) if e.to_string().contains("already exists") => {
                let existing = self
                    .iter_proposals(source, target, ProposalStatus::Open)
                    .await?;
                if let Some(proposal) = existing.first() {
                    return Err(Error::ProposalExists(proposal.url()));
                }
                return Err(map_api_err(&e));
            }
            Err(e) => return Err(map_api_err(&e)),
        };
        if !request.labels.is_empty() {
            self.client
                .issues(&target_owner, &target_repo)
                .add_labels(pr.number, &request.labels)
                .await
                .map_err(|e| map_api_err(&e))?;
        }
        if !request.reviewers.is_empty() {
            self.client
                .pulls(&target_owner, &target_repo)
                .request_reviews(pr.number, request.reviewers.clone(), Vec::new())
                .await
                .map_err(|e| map_api_err(&e))?;
        }
        self.proposal(&target_owner, &target_repo, &pr)
    }
}

/// A pull request handle.
struct GitHubProposal {
    client: Octocrab,
    owner: String,
    repo: String,
    number: u64,
    html_url: Url,
}

impl GitHubProposal {
    async fn get(&self) -> Result<octocrab::models::pulls::PullRequest> {
        self.client
            .pulls(&self.owner, &self.repo)
            .get(self.number)
            .await
            .map_err(|e| map_api_err(&e))
    }

    async fn set_state(&self, state: octocrab::params::pulls::State) -> Result<()> {
        self.client
            .pulls(&self.owner, &self.repo)
            .update(self.number)
            .state(state)
            .send()
            .await
            .map_err(|e| map_api_err(&e))?;
        Ok(())
    }
}

#[async_trait]
impl MergeProposal for GitHubProposal {
    fn url(&self) -> Url {
        self.html_url.clone()
    }

    async fn get_description(&self) -> Result<Option<String>> {
        Ok(self.get().await?.body)
    }

    async fn set_description(&self, description: &str) -> Result<()> {
        self.client
            .pulls(&self.owner, &self.repo)
            .update(self.number)
            .body(description)
            .send()
            .await
            .map_err(|e| map_api_err(&e))?;
        Ok(())
    }

    async fn get_commit_message(&self) -> Result<Option<String>> {
        // GitHub composes the merge commit message at merge time.
        Ok(None)
    }

    async fn set_commit_message(&self, _message: &str) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "github pull requests have no stored commit message".to_string(),
        ))
    }

    async fn get_title(&self) -> Result<Option<String>> {
        Ok(self.get().await?.title)
    }

    async fn set_title(&self, title: &str) -> Result<()> {
        self.client
            .pulls(&self.owner, &self.repo)
            .update(self.number)
            .title(title)
            .send()
            .await
            .map_err(|e| map_api_err(&e))?;
        Ok(())
    }

    async fn is_closed(&self) -> Result<bool> {
        let pr = self.get().await?;
        Ok(matches!(
            pr.state,
            Some(octocrab::models::IssueState::Closed)
        ) && pr.merged_at.is_none())
    }

    async fn is_merged(&self) -> Result<bool> {
        Ok(self.get().await?.merged_at.is_some())
    }

    async fn close(&self) -> Result<()> {
        self.set_state(octocrab::params::pulls::State::Closed).await
    }

    async fn reopen(&self) -> Result<()> {
        self.set_state(octocrab::params::pulls::State::Open).await
    }

    async fn merge(&self, auto: bool) -> Result<()> {
        if auto {
            return Err(Error::UnsupportedOperation(
                "auto-merge is not available through this client".to_string(),
            ));
        }
        self.client
            .pulls(&self.owner, &self.repo)
            .merge(self.number)
            .send()
            .await
            .map_err(|e| map_api_err(&e))?;
        Ok(())
    }
}
