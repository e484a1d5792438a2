//! Version control abstraction.
//!
//! The reconciliation and publish logic only ever talks to these traits; the
//! concrete machinery lives in the backends ([`memory`], [`git`]). All trait
//! objects are `Send + Sync` so workspaces for independent targets can be
//! driven from separate tasks.

mod memory;

pub mod git;

pub use git::GitVcs;
pub use memory::{MemoryBranch, MemoryRepoHandle, MemoryVcs};

use crate::error::{BranchOpenError, Error, Result};
use crate::types::RevisionId;
use async_trait::async_trait;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Predicate deciding which tags travel with a push.
pub type TagSelector = dyn Fn(&str) -> bool + Send + Sync;

/// A named line of revisions with a distinguished tip.
///
/// Branch handles are cheap references into externally-owned storage; the
/// core never owns remote state.
#[async_trait]
pub trait Branch: Send + Sync {
    /// Downcast support for backends that can only talk to their own kind.
    fn as_any(&self) -> &dyn Any;

    /// Identifying URL.
    fn url(&self) -> Url;

    /// Symbolic name for colocated branches sharing one repository.
    fn name(&self) -> Option<String>;

    /// The tip revision; null for a branch without history.
    async fn last_revision(&self) -> Result<RevisionId>;

    /// The repository backing this branch.
    fn repository(&self) -> Arc<dyn Repository>;

    /// Open a sibling branch living in the same repository.
    async fn open_colocated(&self, name: &str) -> Result<Arc<dyn Branch>>;

    /// Handle for a sibling branch used as a push target; unlike
    /// [`Branch::open_colocated`] the branch need not exist yet.
    async fn colocated_for_push(&self, name: &str) -> Result<Arc<dyn Branch>>;

    /// Push this branch's history to `target`.
    ///
    /// Without `overwrite` the push must be a fast-forward; a target tip that
    /// is not an ancestor of the pushed revision fails with
    /// [`Error::Diverged`].
    async fn push(
        &self,
        target: &dyn Branch,
        overwrite: bool,
        stop_revision: Option<&RevisionId>,
        tag_selector: Option<&TagSelector>,
    ) -> Result<()>;
}

/// Revision storage shared by the branches of one repository.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    async fn is_ancestor(&self, ancestor: &RevisionId, descendant: &RevisionId) -> Result<bool>;

    /// The best common ancestor of two revisions, or `None` for unrelated
    /// histories.
    async fn common_ancestor(
        &self,
        a: &RevisionId,
        b: &RevisionId,
    ) -> Result<Option<RevisionId>>;

    /// Copy `revision` and its ancestry from `source` into this repository.
    async fn fetch(&self, source: &dyn Repository, revision: &RevisionId) -> Result<()>;

    /// Snapshot of the tree as of `revid`.
    async fn revision_tree(&self, revid: &RevisionId) -> Result<Tree>;
}

/// The live, mutable working copy owned by a workspace.
#[async_trait]
pub trait LocalTree: Send + Sync {
    /// The local primary branch.
    fn branch(&self) -> Arc<dyn Branch>;

    /// Filesystem location, when the backend has one.
    fn path(&self) -> Option<PathBuf>;

    /// Tip of the local primary branch.
    async fn last_revision(&self) -> Result<RevisionId>;

    /// Pull `source` into the local branch.
    ///
    /// With `overwrite == false` this is fast-forward-only and fails with
    /// [`Error::Diverged`] when the histories have forked.
    async fn pull(&self, source: &dyn Branch, overwrite: bool) -> Result<()>;

    /// Tip of a local colocated branch, if it exists.
    async fn colocated_tip(&self, name: &str) -> Result<Option<RevisionId>>;

    /// Fetch `from_name` on `source` into the local colocated branch
    /// `to_name`, creating it when absent.
    async fn fetch_colocated(
        &self,
        source: &dyn Branch,
        from_name: &str,
        to_name: &str,
        overwrite: bool,
    ) -> Result<()>;

    /// Read a file from the working copy.
    async fn get_file(&self, path: &str) -> Result<Option<String>>;

    /// Write a file into the working copy.
    async fn put_file(&self, path: &str, content: &str) -> Result<()>;

    /// Remove a file from the working copy.
    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Whether the working copy differs from its basis.
    async fn has_changes(&self) -> Result<bool>;

    /// Commit the working copy, returning the new tip.
    async fn commit(&self, message: &str) -> Result<RevisionId>;

    /// The committed tree the working copy is based on.
    async fn basis_tree(&self) -> Result<Tree>;

    /// Snapshot of an arbitrary revision, falling back to the repository
    /// when the working copy doesn't have it.
    async fn revision_tree(&self, revid: &RevisionId) -> Result<Tree>;

    /// Give up ownership of the on-disk copy so a later process can publish
    /// from it; returns its path when there is one.
    fn defer_cleanup(&mut self) -> Option<PathBuf>;
}

/// Capability object for one VCS kind: probe URLs, open branches, create
/// working copies.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Short backend label ("git", "memory").
    fn vcs_type(&self) -> &'static str;

    /// Whether this backend is worth probing for the URL.
    fn supports_url(&self, url: &Url) -> bool;

    /// Open a branch at a URL.
    async fn open_branch(
        &self,
        url: &Url,
        name: Option<&str>,
    ) -> std::result::Result<Arc<dyn Branch>, BranchOpenError>;

    /// Create an isolated local working copy derived from `source`,
    /// bringing along the given colocated branches (source name to local
    /// name).
    async fn sprout(
        &self,
        source: &dyn Branch,
        colocated: &HashMap<String, String>,
    ) -> Result<Box<dyn LocalTree>>;

    /// Create a brand-new empty working copy with no history.
    async fn create_empty(&self) -> Result<Box<dyn LocalTree>>;
}

/// Static prober mapping, built once at startup and passed explicitly.
#[derive(Clone, Default)]
pub struct ProberRegistry {
    probers: Vec<Arc<dyn Vcs>>,
}

impl ProberRegistry {
    /// Build a registry from an ordered list of backends.
    pub fn new(probers: Vec<Arc<dyn Vcs>>) -> Self {
        Self { probers }
    }

    /// The registry with the standard backends.
    pub fn standard() -> Self {
        Self::new(vec![Arc::new(git::GitVcs::new())])
    }

    /// All registered probers, in priority order.
    pub fn probers(&self) -> &[Arc<dyn Vcs>] {
        &self.probers
    }
}

/// Probers relevant to a VCS type, in probe order.
///
/// With a type given, only that backend is returned (empty when unknown);
/// without one, every registered backend is tried.
pub fn probers_for(vcs_type: Option<&str>, registry: &ProberRegistry) -> Vec<Arc<dyn Vcs>> {
    match vcs_type {
        Some(t) => registry
            .probers()
            .iter()
            .filter(|p| p.vcs_type() == t)
            .cloned()
            .collect(),
        None => registry.probers().to_vec(),
    }
}

/// Open a branch by URL, trying each registered backend in order.
pub async fn open_branch(
    registry: &ProberRegistry,
    url: &Url,
    name: Option<&str>,
    vcs_type: Option<&str>,
) -> std::result::Result<Arc<dyn Branch>, BranchOpenError> {
    let mut last_err = None;
    for prober in probers_for(vcs_type, registry) {
        if !prober.supports_url(url) {
            continue;
        }
        match prober.open_branch(url, name).await {
            Ok(branch) => return Ok(branch),
            Err(e) => {
                tracing::debug!("prober {} failed for {}: {}", prober.vcs_type(), url, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BranchOpenError::Unsupported {
        url: url.clone(),
        description: "no backend recognises this URL".to_string(),
        vcs: vcs_type.map(ToString::to_string),
    }))
}

/// The kind of change to one path between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Path exists only in the new tree.
    Added,
    /// Path exists only in the old tree.
    Removed,
    /// Path exists in both with different content.
    Modified,
}

/// One file-level difference between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    /// Path within the tree.
    pub path: String,
    /// What happened to it.
    pub kind: ChangeKind,
    /// Content on the old side, if any.
    pub old: Option<String>,
    /// Content on the new side, if any.
    pub new: Option<String>,
}

/// An immutable path-to-content snapshot of a branch at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    files: BTreeMap<String, String>,
}

impl Tree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of a file, if present.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Insert or replace a file.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Remove a file; returns whether it existed.
    pub fn remove(&mut self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }

    /// Iterate over (path, content) pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the tree has no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// File-level differences from `self` (old) to `new`.
    pub fn diff(&self, new: &Tree) -> Vec<TreeChange> {
        let mut changes = Vec::new();
        for (path, old_content) in &self.files {
            match new.files.get(path) {
                None => changes.push(TreeChange {
                    path: path.clone(),
                    kind: ChangeKind::Removed,
                    old: Some(old_content.clone()),
                    new: None,
                }),
                Some(new_content) if new_content != old_content => changes.push(TreeChange {
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                    old: Some(old_content.clone()),
                    new: Some(new_content.clone()),
                }),
                Some(_) => {}
            }
        }
        for (path, new_content) in &new.files {
            if !self.files.contains_key(path) {
                changes.push(TreeChange {
                    path: path.clone(),
                    kind: ChangeKind::Added,
                    old: None,
                    new: Some(new_content.clone()),
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }
}

/// Write a unified-style diff between two trees.
pub fn write_diff(
    old: &Tree,
    new: &Tree,
    out: &mut dyn std::io::Write,
    old_label: Option<&str>,
    new_label: Option<&str>,
) -> Result<()> {
    let old_label = old_label.unwrap_or("old");
    let new_label = new_label.unwrap_or("new");
    for change in old.diff(new) {
        writeln!(out, "--- {}/{}", old_label, change.path)?;
        writeln!(out, "+++ {}/{}", new_label, change.path)?;
        if let Some(old_content) = &change.old {
            for line in old_content.lines() {
                writeln!(out, "-{}", line)?;
            }
        }
        if let Some(new_content) = &change.new {
            for line in new_content.lines() {
                writeln!(out, "+{}", line)?;
            }
        }
    }
    Ok(())
}

/// Convenience downcast for backends that require their own branch kind.
pub(crate) fn expect_backend<'a, T: 'static>(branch: &'a dyn Branch, backend: &str) -> Result<&'a T> {
    branch
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Vcs(format!("branch {} is not a {} branch", branch.url(), backend)))
}
