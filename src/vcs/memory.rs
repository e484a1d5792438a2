//! In-memory VCS backend.
//!
//! A complete revision-DAG implementation of the [`Vcs`] traits, used for
//! merge previews and as the backend the test suite drives. Repositories are
//! cheap handles onto shared state, so branch handles can be cloned freely.

use crate::error::{BranchOpenError, Error, Result};
use crate::types::RevisionId;
use crate::vcs::{expect_backend, Branch, LocalTree, Repository, TagSelector, Tree, Vcs};
use async_trait::async_trait;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);
static NEXT_REPO: AtomicU64 = AtomicU64::new(1);

fn new_revid() -> RevisionId {
    RevisionId::from(format!("r{}", NEXT_REVISION.fetch_add(1, Ordering::SeqCst)))
}

#[derive(Debug, Clone)]
struct StoredRevision {
    parents: Vec<RevisionId>,
    tree: Tree,
    #[allow(dead_code)]
    message: String,
}

#[derive(Debug, Default)]
struct StoreInner {
    revisions: HashMap<RevisionId, StoredRevision>,
    /// Branch name to tip; the empty string is the primary branch.
    branches: HashMap<String, RevisionId>,
    tags: HashMap<String, RevisionId>,
    /// Working copy contents, for handles used as a local tree.
    working: Tree,
}

/// Handle onto one in-memory repository.
#[derive(Clone)]
pub struct MemoryRepoHandle {
    inner: Arc<Mutex<StoreInner>>,
    url: Url,
}

impl MemoryRepoHandle {
    fn new(url: Url) -> Self {
        let mut inner = StoreInner::default();
        inner.branches.insert(String::new(), RevisionId::null());
        Self {
            inner: Arc::new(Mutex::new(inner)),
            url,
        }
    }

    /// The repository URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Handle onto a branch of this repository, creating an empty one when
    /// absent. The empty name is the primary branch.
    pub fn branch(&self, name: &str) -> MemoryBranch {
        self.inner
            .lock()
            .unwrap()
            .branches
            .entry(name.to_string())
            .or_insert_with(RevisionId::null);
        MemoryBranch {
            repo: self.clone(),
            branch_name: name.to_string(),
        }
    }

    /// Whether a branch of that name exists.
    pub fn has_branch(&self, name: &str) -> bool {
        self.inner.lock().unwrap().branches.contains_key(name)
    }

    /// Record a commit on `branch_name` applying `edits` (path, content;
    /// empty content removes) on top of the current tip. Test fixtures and
    /// change producers go through this.
    pub fn commit_on(
        &self,
        branch_name: &str,
        message: &str,
        edits: &[(&str, Option<&str>)],
    ) -> RevisionId {
        let mut inner = self.inner.lock().unwrap();
        let tip = inner
            .branches
            .get(branch_name)
            .cloned()
            .unwrap_or_else(RevisionId::null);
        let mut tree = if tip.is_null() {
            Tree::new()
        } else {
            inner.revisions[&tip].tree.clone()
        };
        for (path, content) in edits {
            match content {
                Some(c) => tree.insert(*path, *c),
                None => {
                    tree.remove(path);
                }
            }
        }
        let revid = new_revid();
        let parents = if tip.is_null() { vec![] } else { vec![tip] };
        inner.revisions.insert(
            revid.clone(),
            StoredRevision {
                parents,
                tree: tree.clone(),
                message: message.to_string(),
            },
        );
        inner.branches.insert(branch_name.to_string(), revid.clone());
        if branch_name.is_empty() {
            inner.working = tree;
        }
        revid
    }

    /// Set a tag.
    pub fn set_tag(&self, name: &str, revid: RevisionId) {
        self.inner.lock().unwrap().tags.insert(name.to_string(), revid);
    }

    /// Look up a tag.
    pub fn tag(&self, name: &str) -> Option<RevisionId> {
        self.inner.lock().unwrap().tags.get(name).cloned()
    }

    fn tip(&self, branch_name: &str) -> Option<RevisionId> {
        self.inner.lock().unwrap().branches.get(branch_name).cloned()
    }

    fn set_tip(&self, branch_name: &str, revid: RevisionId) {
        self.inner
            .lock()
            .unwrap()
            .branches
            .insert(branch_name.to_string(), revid);
    }

    fn ancestors(&self, start: &RevisionId) -> HashSet<RevisionId> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        if !start.is_null() {
            queue.push_back(start.clone());
        }
        while let Some(rev) = queue.pop_front() {
            if !seen.insert(rev.clone()) {
                continue;
            }
            if let Some(stored) = inner.revisions.get(&rev) {
                for parent in &stored.parents {
                    queue.push_back(parent.clone());
                }
            }
        }
        seen
    }

    fn tree_of(&self, revid: &RevisionId) -> Result<Tree> {
        if revid.is_null() {
            return Ok(Tree::new());
        }
        self.inner
            .lock()
            .unwrap()
            .revisions
            .get(revid)
            .map(|r| r.tree.clone())
            .ok_or_else(|| Error::Vcs(format!("no such revision: {}", revid)))
    }

    fn copy_ancestry_from(&self, source: &MemoryRepoHandle, revision: &RevisionId) {
        if revision.is_null() {
            return;
        }
        // Lock ordering: source first, then self. Handles onto the same
        // store share one mutex, so guard against self-fetch.
        if Arc::ptr_eq(&self.inner, &source.inner) {
            return;
        }
        let source_inner = source.inner.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        let mut queue = VecDeque::from([revision.clone()]);
        while let Some(rev) = queue.pop_front() {
            if rev.is_null() || inner.revisions.contains_key(&rev) {
                continue;
            }
            if let Some(stored) = source_inner.revisions.get(&rev) {
                inner.revisions.insert(rev.clone(), stored.clone());
                for parent in &stored.parents {
                    queue.push_back(parent.clone());
                }
            }
        }
    }
}

#[async_trait]
impl Repository for MemoryRepoHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn is_ancestor(&self, ancestor: &RevisionId, descendant: &RevisionId) -> Result<bool> {
        if ancestor.is_null() || ancestor == descendant {
            return Ok(true);
        }
        Ok(self.ancestors(descendant).contains(ancestor))
    }

    async fn common_ancestor(
        &self,
        a: &RevisionId,
        b: &RevisionId,
    ) -> Result<Option<RevisionId>> {
        if a.is_null() || b.is_null() {
            return Ok(Some(RevisionId::null()));
        }
        let a_ancestors = self.ancestors(a);
        // Breadth-first from b so the nearest shared revision wins.
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b.clone()]);
        while let Some(rev) = queue.pop_front() {
            if !seen.insert(rev.clone()) {
                continue;
            }
            if a_ancestors.contains(&rev) {
                return Ok(Some(rev));
            }
            if let Some(stored) = inner.revisions.get(&rev) {
                for parent in &stored.parents {
                    queue.push_back(parent.clone());
                }
            }
        }
        Ok(None)
    }

    async fn fetch(&self, source: &dyn Repository, revision: &RevisionId) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<MemoryRepoHandle>()
            .ok_or_else(|| Error::Vcs("cannot fetch across VCS kinds".to_string()))?;
        self.copy_ancestry_from(source, revision);
        Ok(())
    }

    async fn revision_tree(&self, revid: &RevisionId) -> Result<Tree> {
        self.tree_of(revid)
    }
}

/// A branch of an in-memory repository.
#[derive(Clone)]
pub struct MemoryBranch {
    repo: MemoryRepoHandle,
    branch_name: String,
}

impl MemoryBranch {
    /// The repository this branch lives in.
    pub fn repo(&self) -> &MemoryRepoHandle {
        &self.repo
    }
}

#[async_trait]
impl Branch for MemoryBranch {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn url(&self) -> Url {
        self.repo.url.clone()
    }

    fn name(&self) -> Option<String> {
        if self.branch_name.is_empty() {
            None
        } else {
            Some(self.branch_name.clone())
        }
    }

    async fn last_revision(&self) -> Result<RevisionId> {
        Ok(self
            .repo
            .tip(&self.branch_name)
            .unwrap_or_else(RevisionId::null))
    }

    fn repository(&self) -> Arc<dyn Repository> {
        Arc::new(self.repo.clone())
    }

    async fn open_colocated(&self, name: &str) -> Result<Arc<dyn Branch>> {
        if !self.repo.has_branch(name) {
            return Err(Error::NotBranch(self.url()));
        }
        Ok(Arc::new(MemoryBranch {
            repo: self.repo.clone(),
            branch_name: name.to_string(),
        }))
    }

    async fn colocated_for_push(&self, name: &str) -> Result<Arc<dyn Branch>> {
        Ok(Arc::new(self.repo.branch(name)))
    }

    async fn push(
        &self,
        target: &dyn Branch,
        overwrite: bool,
        stop_revision: Option<&RevisionId>,
        tag_selector: Option<&TagSelector>,
    ) -> Result<()> {
        let target = expect_backend::<MemoryBranch>(target, "memory")?;
        let stop = match stop_revision {
            Some(r) => r.clone(),
            None => self.last_revision().await?,
        };
        target.repo.copy_ancestry_from(&self.repo, &stop);
        let target_tip = target
            .repo
            .tip(&target.branch_name)
            .unwrap_or_else(RevisionId::null);
        if !overwrite && !target.repo.is_ancestor(&target_tip, &stop).await? {
            return Err(Error::Diverged);
        }
        target.repo.set_tip(&target.branch_name, stop);
        let tags: Vec<(String, RevisionId)> = {
            let inner = self.repo.inner.lock().unwrap();
            inner
                .tags
                .iter()
                .filter(|(name, _)| tag_selector.is_none_or(|sel| sel(name)))
                .map(|(n, r)| (n.clone(), r.clone()))
                .collect()
        };
        for (name, revid) in tags {
            target.repo.copy_ancestry_from(&self.repo, &revid);
            target.repo.set_tag(&name, revid);
        }
        Ok(())
    }
}

/// A working copy backed by an in-memory repository.
pub struct MemoryTree {
    repo: MemoryRepoHandle,
}

impl MemoryTree {
    fn primary_tip(&self) -> RevisionId {
        self.repo.tip("").unwrap_or_else(RevisionId::null)
    }
}

#[async_trait]
impl LocalTree for MemoryTree {
    fn branch(&self) -> Arc<dyn Branch> {
        Arc::new(self.repo.branch(""))
    }

    fn path(&self) -> Option<PathBuf> {
        None
    }

    async fn last_revision(&self) -> Result<RevisionId> {
        Ok(self.primary_tip())
    }

    async fn pull(&self, source: &dyn Branch, overwrite: bool) -> Result<()> {
        let source = expect_backend::<MemoryBranch>(source, "memory")?;
        let src_tip = source.last_revision().await?;
        self.repo.copy_ancestry_from(&source.repo, &src_tip);
        let tip = self.primary_tip();
        if overwrite {
            self.repo.set_tip("", src_tip.clone());
        } else if self.repo.is_ancestor(&tip, &src_tip).await? {
            self.repo.set_tip("", src_tip.clone());
        } else if self.repo.is_ancestor(&src_tip, &tip).await? {
            // Already up to date.
            return Ok(());
        } else {
            return Err(Error::Diverged);
        }
        let tree = self.repo.tree_of(&src_tip)?;
        self.repo.inner.lock().unwrap().working = tree;
        Ok(())
    }

    async fn colocated_tip(&self, name: &str) -> Result<Option<RevisionId>> {
        Ok(self.repo.tip(name))
    }

    async fn fetch_colocated(
        &self,
        source: &dyn Branch,
        from_name: &str,
        to_name: &str,
        overwrite: bool,
    ) -> Result<()> {
        let colo = source.open_colocated(from_name).await?;
        let colo = expect_backend::<MemoryBranch>(colo.as_ref(), "memory")?;
        let src_tip = colo.last_revision().await?;
        self.repo.copy_ancestry_from(&colo.repo, &src_tip);
        match self.repo.tip(to_name) {
            Some(local_tip) if !overwrite => {
                if self.repo.is_ancestor(&local_tip, &src_tip).await? {
                    self.repo.set_tip(to_name, src_tip);
                } else if self.repo.is_ancestor(&src_tip, &local_tip).await? {
                    // Local side is ahead; keep it.
                } else {
                    return Err(Error::Diverged);
                }
            }
            _ => self.repo.set_tip(to_name, src_tip),
        }
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .repo
            .inner
            .lock()
            .unwrap()
            .working
            .get(path)
            .map(ToString::to_string))
    }

    async fn put_file(&self, path: &str, content: &str) -> Result<()> {
        self.repo.inner.lock().unwrap().working.insert(path, content);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.repo.inner.lock().unwrap().working.remove(path);
        Ok(())
    }

    async fn has_changes(&self) -> Result<bool> {
        let basis = self.repo.tree_of(&self.primary_tip())?;
        Ok(self.repo.inner.lock().unwrap().working != basis)
    }

    async fn commit(&self, message: &str) -> Result<RevisionId> {
        let working = self.repo.inner.lock().unwrap().working.clone();
        let mut inner = self.repo.inner.lock().unwrap();
        let tip = inner
            .branches
            .get("")
            .cloned()
            .unwrap_or_else(RevisionId::null);
        let revid = new_revid();
        let parents = if tip.is_null() { vec![] } else { vec![tip] };
        inner.revisions.insert(
            revid.clone(),
            StoredRevision {
                parents,
                tree: working,
                message: message.to_string(),
            },
        );
        inner.branches.insert(String::new(), revid.clone());
        Ok(revid)
    }

    async fn basis_tree(&self) -> Result<Tree> {
        self.repo.tree_of(&self.primary_tip())
    }

    async fn revision_tree(&self, revid: &RevisionId) -> Result<Tree> {
        self.repo.tree_of(revid)
    }

    fn defer_cleanup(&mut self) -> Option<PathBuf> {
        None
    }
}

/// The in-memory backend.
#[derive(Clone, Default)]
pub struct MemoryVcs {
    repos: Arc<Mutex<HashMap<String, MemoryRepoHandle>>>,
}

impl MemoryVcs {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the repository at `url`.
    pub fn create_repo(&self, url: &str) -> MemoryRepoHandle {
        let parsed = Url::parse(url).expect("valid repo url");
        self.repos
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert_with(|| MemoryRepoHandle::new(parsed))
            .clone()
    }

    /// Look up an existing repository.
    pub fn get_repo(&self, url: &Url) -> Option<MemoryRepoHandle> {
        self.repos.lock().unwrap().get(url.as_str()).cloned()
    }
}

#[async_trait]
impl Vcs for MemoryVcs {
    fn vcs_type(&self) -> &'static str {
        "memory"
    }

    fn supports_url(&self, url: &Url) -> bool {
        url.scheme() == "mem"
    }

    async fn open_branch(
        &self,
        url: &Url,
        name: Option<&str>,
    ) -> std::result::Result<Arc<dyn Branch>, BranchOpenError> {
        let repo = self.get_repo(url).ok_or_else(|| BranchOpenError::Missing {
            url: url.clone(),
            description: "no such in-memory repository".to_string(),
        })?;
        let branch_name = name.unwrap_or("");
        if !branch_name.is_empty() && !repo.has_branch(branch_name) {
            return Err(BranchOpenError::Missing {
                url: url.clone(),
                description: format!("no branch named {}", branch_name),
            });
        }
        Ok(Arc::new(repo.branch(branch_name)))
    }

    async fn sprout(
        &self,
        source: &dyn Branch,
        colocated: &HashMap<String, String>,
    ) -> Result<Box<dyn LocalTree>> {
        let source = expect_backend::<MemoryBranch>(source, "memory")?;
        let n = NEXT_REPO.fetch_add(1, Ordering::SeqCst);
        let url = Url::parse(&format!("mem://local/{}", n)).unwrap();
        let local = MemoryRepoHandle::new(url);
        let tip = source.last_revision().await?;
        local.copy_ancestry_from(&source.repo, &tip);
        local.set_tip("", tip.clone());
        local.inner.lock().unwrap().working = local.tree_of(&tip)?;
        for (from_name, to_name) in colocated {
            if let Some(colo_tip) = source.repo.tip(from_name) {
                local.copy_ancestry_from(&source.repo, &colo_tip);
                local.set_tip(to_name, colo_tip);
            }
        }
        Ok(Box::new(MemoryTree { repo: local }))
    }

    async fn create_empty(&self) -> Result<Box<dyn LocalTree>> {
        let n = NEXT_REPO.fetch_add(1, Ordering::SeqCst);
        let url = Url::parse(&format!("mem://local/{}", n)).unwrap();
        Ok(Box::new(MemoryTree {
            repo: MemoryRepoHandle::new(url),
        }))
    }
}
