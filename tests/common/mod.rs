//! Shared fixtures for the integration tests.

#![allow(dead_code)]

pub mod mock_forge;

use autoprop::types::RevisionId;
use autoprop::vcs::{Branch, MemoryRepoHandle, MemoryVcs};
use std::sync::Arc;

/// A repository at `url` with one commit on the primary branch.
pub fn origin_with_history(vcs: &MemoryVcs, url: &str) -> (MemoryRepoHandle, RevisionId) {
    let repo = vcs.create_repo(url);
    let revid = repo.commit_on("", "initial commit", &[("README.md", Some("hello\n"))]);
    (repo, revid)
}

/// The primary branch of a repository as a trait object.
pub fn primary(repo: &MemoryRepoHandle) -> Arc<dyn Branch> {
    Arc::new(repo.branch(""))
}

/// A repository seeded with the ancestry of `revid` from `source`, its
/// primary branch set to that revision. Used to fake the branch a previous
/// run left behind.
pub async fn derived_at(
    vcs: &MemoryVcs,
    source: &MemoryRepoHandle,
    url: &str,
    revid: &RevisionId,
) -> MemoryRepoHandle {
    let repo = vcs.create_repo(url);
    source
        .branch("")
        .push(&repo.branch(""), true, Some(revid), None)
        .await
        .expect("seeding derived repo");
    repo
}
