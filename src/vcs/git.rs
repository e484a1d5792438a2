//! Git backend, driving the `git` binary.
//!
//! Remote branches are thin handles resolved through `ls-remote`; all real
//! history manipulation happens inside a temporary clone owned by
//! [`GitTree`]. Pushes classify git's stderr into the crate error taxonomy
//! so the publish logic can react to divergence and denied writes.

use crate::error::{BranchOpenError, Error, Result};
use crate::types::RevisionId;
use crate::vcs::{Branch, LocalTree, Repository, TagSelector, Tree, Vcs};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;
use url::Url;

async fn run_git(cwd: Option<&Path>, args: &[&str]) -> Result<Output> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.args(args);
    let output = cmd.output().await?;
    Ok(output)
}

async fn git_ok(cwd: Option<&Path>, args: &[&str]) -> Result<String> {
    let output = run_git(cwd, args).await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(Error::Vcs(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn classify_open_error(url: &Url, stderr: &str) -> BranchOpenError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("does not appear to be a git repository")
    {
        BranchOpenError::Missing {
            url: url.clone(),
            description: stderr.to_string(),
        }
    } else if lower.contains("could not resolve host")
        || lower.contains("timed out")
        || lower.contains("connection refused")
    {
        BranchOpenError::TemporarilyUnavailable {
            url: url.clone(),
            description: stderr.to_string(),
        }
    } else if lower.contains("rate limit") {
        BranchOpenError::RateLimited {
            url: url.clone(),
            description: stderr.to_string(),
            retry_after: None,
        }
    } else {
        BranchOpenError::Unavailable {
            url: url.clone(),
            description: stderr.to_string(),
        }
    }
}

fn classify_push_error(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("non-fast-forward")
        || lower.contains("fetch first")
        || lower.contains("stale info")
    {
        Error::Diverged
    } else if lower.contains("permission denied")
        || lower.contains("protected branch")
        || lower.contains("403")
        || lower.contains("not allowed")
    {
        Error::PermissionDenied(stderr.trim().to_string())
    } else {
        Error::Vcs(format!("git push failed: {}", stderr.trim()))
    }
}

fn heads_ref(name: Option<&str>) -> String {
    match name {
        Some(n) => format!("refs/heads/{}", n),
        None => "HEAD".to_string(),
    }
}

async fn ls_remote_tip(url: &Url, name: Option<&str>) -> Result<RevisionId> {
    let refname = heads_ref(name);
    let out = git_ok(None, &["ls-remote", url.as_str(), &refname]).await?;
    match out.split_whitespace().next() {
        Some(sha) => Ok(RevisionId::from(sha)),
        None => Ok(RevisionId::null()),
    }
}

async fn remote_default_branch(url: &Url) -> Result<String> {
    let out = git_ok(None, &["ls-remote", "--symref", url.as_str(), "HEAD"]).await?;
    for line in out.lines() {
        if let Some(rest) = line.strip_prefix("ref: refs/heads/") {
            if let Some(name) = rest.split_whitespace().next() {
                return Ok(name.to_string());
            }
        }
    }
    // Empty repositories advertise no HEAD symref.
    Ok("main".to_string())
}

async fn tree_at(path: &Path, rev: &str) -> Result<Tree> {
    let mut tree = Tree::new();
    let listing = match git_ok(Some(path), &["ls-tree", "-r", "--name-only", rev]).await {
        Ok(listing) => listing,
        Err(_) => return Ok(tree),
    };
    for file in listing.lines().filter(|l| !l.is_empty()) {
        let spec = format!("{}:{}", rev, file);
        let content = git_ok(Some(path), &["show", &spec]).await?;
        tree.insert(file, content);
    }
    Ok(tree)
}

/// A branch reachable only over the wire.
pub struct RemoteGitBranch {
    url: Url,
    branch_name: Option<String>,
}

/// Handle onto a remote branch without probing it first.
///
/// The forge layer uses this for branches it knows exist (or is about to
/// create by pushing).
pub fn remote_branch(url: Url, name: Option<String>) -> Arc<dyn Branch> {
    Arc::new(RemoteGitBranch {
        url,
        branch_name: name,
    })
}

#[async_trait]
impl Branch for RemoteGitBranch {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn url(&self) -> Url {
        self.url.clone()
    }

    fn name(&self) -> Option<String> {
        self.branch_name.clone()
    }

    async fn last_revision(&self) -> Result<RevisionId> {
        ls_remote_tip(&self.url, self.branch_name.as_deref()).await
    }

    fn repository(&self) -> Arc<dyn Repository> {
        Arc::new(RemoteGitRepo {
            url: self.url.clone(),
        })
    }

    async fn open_colocated(&self, name: &str) -> Result<Arc<dyn Branch>> {
        let refname = heads_ref(Some(name));
        let out = git_ok(None, &["ls-remote", self.url.as_str(), &refname]).await?;
        if out.is_empty() {
            return Err(Error::NotBranch(self.url.clone()));
        }
        Ok(Arc::new(RemoteGitBranch {
            url: self.url.clone(),
            branch_name: Some(name.to_string()),
        }))
    }

    async fn colocated_for_push(&self, name: &str) -> Result<Arc<dyn Branch>> {
        Ok(Arc::new(RemoteGitBranch {
            url: self.url.clone(),
            branch_name: Some(name.to_string()),
        }))
    }

    async fn push(
        &self,
        _target: &dyn Branch,
        _overwrite: bool,
        _stop_revision: Option<&RevisionId>,
        _tag_selector: Option<&TagSelector>,
    ) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "pushing between two remote git branches".to_string(),
        ))
    }
}

/// Remote repository handle; answers only what `ls-remote` can answer.
pub struct RemoteGitRepo {
    url: Url,
}

#[async_trait]
impl Repository for RemoteGitRepo {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn is_ancestor(&self, _ancestor: &RevisionId, _descendant: &RevisionId) -> Result<bool> {
        Err(Error::Vcs(
            "ancestry queries require a local clone".to_string(),
        ))
    }

    async fn common_ancestor(
        &self,
        _a: &RevisionId,
        _b: &RevisionId,
    ) -> Result<Option<RevisionId>> {
        Err(Error::Vcs(
            "ancestry queries require a local clone".to_string(),
        ))
    }

    async fn fetch(&self, _source: &dyn Repository, _revision: &RevisionId) -> Result<()> {
        Err(Error::Vcs(
            "fetching into a remote repository is not supported".to_string(),
        ))
    }

    async fn revision_tree(&self, _revid: &RevisionId) -> Result<Tree> {
        Err(Error::Vcs(
            "tree access requires a local clone".to_string(),
        ))
    }
}

/// A branch of a local clone.
pub struct LocalGitBranch {
    path: PathBuf,
    url: Url,
    branch_name: Option<String>,
}

impl LocalGitBranch {
    fn rev_spec(&self) -> String {
        heads_ref(self.branch_name.as_deref())
    }
}

#[async_trait]
impl Branch for LocalGitBranch {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn url(&self) -> Url {
        self.url.clone()
    }

    fn name(&self) -> Option<String> {
        self.branch_name.clone()
    }

    async fn last_revision(&self) -> Result<RevisionId> {
        let spec = self.rev_spec();
        let out = run_git(
            Some(&self.path),
            &["rev-parse", "--verify", "--quiet", &spec],
        )
        .await?;
        if out.status.success() {
            Ok(RevisionId::from(
                String::from_utf8_lossy(&out.stdout).trim(),
            ))
        } else {
            Ok(RevisionId::null())
        }
    }

    fn repository(&self) -> Arc<dyn Repository> {
        Arc::new(LocalGitRepo {
            path: self.path.clone(),
        })
    }

    async fn open_colocated(&self, name: &str) -> Result<Arc<dyn Branch>> {
        let refname = heads_ref(Some(name));
        let out = run_git(
            Some(&self.path),
            &["rev-parse", "--verify", "--quiet", &refname],
        )
        .await?;
        if !out.status.success() {
            return Err(Error::NotBranch(self.url.clone()));
        }
        Ok(Arc::new(LocalGitBranch {
            path: self.path.clone(),
            url: self.url.clone(),
            branch_name: Some(name.to_string()),
        }))
    }

    async fn colocated_for_push(&self, name: &str) -> Result<Arc<dyn Branch>> {
        Ok(Arc::new(LocalGitBranch {
            path: self.path.clone(),
            url: self.url.clone(),
            branch_name: Some(name.to_string()),
        }))
    }

    async fn push(
        &self,
        target: &dyn Branch,
        overwrite: bool,
        stop_revision: Option<&RevisionId>,
        tag_selector: Option<&TagSelector>,
    ) -> Result<()> {
        let target = target
            .as_any()
            .downcast_ref::<RemoteGitBranch>()
            .ok_or_else(|| Error::Vcs("can only push to a remote git branch".to_string()))?;
        let target_name = match target.branch_name.clone() {
            Some(name) => name,
            None => remote_default_branch(&target.url).await?,
        };
        let local = match stop_revision {
            Some(rev) => rev.to_string(),
            None => self.rev_spec(),
        };
        let refspec = format!("{}:refs/heads/{}", local, target_name);
        let mut args = vec!["push"];
        if overwrite {
            args.push("--force");
        }
        args.push(target.url.as_str());
        args.push(&refspec);
        let output = run_git(Some(&self.path), &args).await?;
        if !output.status.success() {
            return Err(classify_push_error(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }
        if let Some(selector) = tag_selector {
            let tags = git_ok(Some(&self.path), &["tag", "--list"]).await?;
            for tag in tags.lines().filter(|t| !t.is_empty() && selector(t)) {
                let tag_spec = format!("refs/tags/{0}:refs/tags/{0}", tag);
                let output = run_git(
                    Some(&self.path),
                    &["push", "--force", target.url.as_str(), &tag_spec],
                )
                .await?;
                if !output.status.success() {
                    return Err(classify_push_error(&String::from_utf8_lossy(
                        &output.stderr,
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Local repository handle over a clone on disk.
pub struct LocalGitRepo {
    path: PathBuf,
}

#[async_trait]
impl Repository for LocalGitRepo {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn is_ancestor(&self, ancestor: &RevisionId, descendant: &RevisionId) -> Result<bool> {
        if ancestor.is_null() || ancestor == descendant {
            return Ok(true);
        }
        if descendant.is_null() {
            return Ok(false);
        }
        let out = run_git(
            Some(&self.path),
            &[
                "merge-base",
                "--is-ancestor",
                ancestor.as_str(),
                descendant.as_str(),
            ],
        )
        .await?;
        Ok(out.status.success())
    }

    async fn common_ancestor(
        &self,
        a: &RevisionId,
        b: &RevisionId,
    ) -> Result<Option<RevisionId>> {
        if a.is_null() || b.is_null() {
            return Ok(Some(RevisionId::null()));
        }
        let out = run_git(Some(&self.path), &["merge-base", a.as_str(), b.as_str()]).await?;
        if out.status.success() {
            Ok(Some(RevisionId::from(
                String::from_utf8_lossy(&out.stdout).trim(),
            )))
        } else {
            Ok(None)
        }
    }

    async fn fetch(&self, source: &dyn Repository, revision: &RevisionId) -> Result<()> {
        if revision.is_null() {
            return Ok(());
        }
        let from = if let Some(remote) = source.as_any().downcast_ref::<RemoteGitRepo>() {
            remote.url.to_string()
        } else if let Some(local) = source.as_any().downcast_ref::<LocalGitRepo>() {
            local.path.display().to_string()
        } else {
            return Err(Error::Vcs("cannot fetch across VCS kinds".to_string()));
        };
        git_ok(Some(&self.path), &["fetch", &from, revision.as_str()]).await?;
        Ok(())
    }

    async fn revision_tree(&self, revid: &RevisionId) -> Result<Tree> {
        if revid.is_null() {
            return Ok(Tree::new());
        }
        tree_at(&self.path, revid.as_str()).await
    }
}

/// A temporary clone acting as the workspace's local tree.
pub struct GitTree {
    dir: Option<TempDir>,
    path: PathBuf,
    url: Url,
}

impl GitTree {
    async fn git(&self, args: &[&str]) -> Result<String> {
        git_ok(Some(&self.path), args).await
    }
}

#[async_trait]
impl LocalTree for GitTree {
    fn branch(&self) -> Arc<dyn Branch> {
        Arc::new(LocalGitBranch {
            path: self.path.clone(),
            url: self.url.clone(),
            branch_name: None,
        })
    }

    fn path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    async fn last_revision(&self) -> Result<RevisionId> {
        let out = run_git(
            Some(&self.path),
            &["rev-parse", "--verify", "--quiet", "HEAD"],
        )
        .await?;
        if out.status.success() {
            Ok(RevisionId::from(
                String::from_utf8_lossy(&out.stdout).trim(),
            ))
        } else {
            Ok(RevisionId::null())
        }
    }

    async fn pull(&self, source: &dyn Branch, overwrite: bool) -> Result<()> {
        let src_tip = source.last_revision().await?;
        if src_tip.is_null() {
            return Ok(());
        }
        let url = source.url();
        let refname = heads_ref(source.name().as_deref());
        self.git(&["fetch", url.as_str(), &refname]).await?;
        if overwrite {
            self.git(&["reset", "--hard", "FETCH_HEAD"]).await?;
            return Ok(());
        }
        let output = run_git(Some(&self.path), &["merge", "--ff-only", "FETCH_HEAD"]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("fast-forward") || stderr.contains("diverg") {
                Err(Error::Diverged)
            } else {
                Err(Error::Vcs(format!("git merge failed: {}", stderr.trim())))
            }
        }
    }

    async fn colocated_tip(&self, name: &str) -> Result<Option<RevisionId>> {
        let refname = heads_ref(Some(name));
        let out = run_git(
            Some(&self.path),
            &["rev-parse", "--verify", "--quiet", &refname],
        )
        .await?;
        if out.status.success() {
            Ok(Some(RevisionId::from(
                String::from_utf8_lossy(&out.stdout).trim(),
            )))
        } else {
            Ok(None)
        }
    }

    async fn fetch_colocated(
        &self,
        source: &dyn Branch,
        from_name: &str,
        to_name: &str,
        overwrite: bool,
    ) -> Result<()> {
        let url = source.url();
        let probe = git_ok(
            None,
            &["ls-remote", url.as_str(), &heads_ref(Some(from_name))],
        )
        .await?;
        if probe.is_empty() {
            return Err(Error::NotBranch(url));
        }
        let refspec = format!("refs/heads/{}:refs/heads/{}", from_name, to_name);
        let mut args = vec!["fetch"];
        if overwrite {
            args.push("--force");
        }
        args.push(url.as_str());
        args.push(&refspec);
        let output = run_git(Some(&self.path), &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("non-fast-forward") || stderr.contains("rejected") {
                Err(Error::Diverged)
            } else {
                Err(Error::Vcs(format!("git fetch failed: {}", stderr.trim())))
            }
        }
    }

    async fn get_file(&self, path: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path.join(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.path.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.path.join(path)).await?;
        Ok(())
    }

    async fn has_changes(&self) -> Result<bool> {
        let status = self.git(&["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    async fn commit(&self, message: &str) -> Result<RevisionId> {
        self.git(&["add", "-A"]).await?;
        self.git(&[
            "-c",
            "user.name=autoprop",
            "-c",
            "user.email=autoprop@localhost",
            "commit",
            "-m",
            message,
        ])
        .await?;
        self.last_revision().await
    }

    async fn basis_tree(&self) -> Result<Tree> {
        let head = self.last_revision().await?;
        if head.is_null() {
            return Ok(Tree::new());
        }
        tree_at(&self.path, head.as_str()).await
    }

    async fn revision_tree(&self, revid: &RevisionId) -> Result<Tree> {
        if revid.is_null() {
            return Ok(Tree::new());
        }
        tree_at(&self.path, revid.as_str()).await
    }

    fn defer_cleanup(&mut self) -> Option<PathBuf> {
        self.dir.take().map(TempDir::keep)
    }
}

/// The git backend.
#[derive(Clone, Copy, Default)]
pub struct GitVcs;

impl GitVcs {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Vcs for GitVcs {
    fn vcs_type(&self) -> &'static str {
        "git"
    }

    fn supports_url(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https" | "git" | "ssh" | "file")
    }

    async fn open_branch(
        &self,
        url: &Url,
        name: Option<&str>,
    ) -> std::result::Result<Arc<dyn Branch>, BranchOpenError> {
        let output = run_git(None, &["ls-remote", url.as_str()])
            .await
            .map_err(|e| BranchOpenError::Unavailable {
                url: url.clone(),
                description: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(classify_open_error(
                url,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        if let Some(branch_name) = name {
            let refname = heads_ref(Some(branch_name));
            let listing = String::from_utf8_lossy(&output.stdout);
            if !listing.lines().any(|l| l.ends_with(&refname)) {
                return Err(BranchOpenError::Missing {
                    url: url.clone(),
                    description: format!("no branch named {}", branch_name),
                });
            }
        }
        Ok(Arc::new(RemoteGitBranch {
            url: url.clone(),
            branch_name: name.map(ToString::to_string),
        }))
    }

    async fn sprout(
        &self,
        source: &dyn Branch,
        colocated: &HashMap<String, String>,
    ) -> Result<Box<dyn LocalTree>> {
        let source_url = source.url();
        let dir = TempDir::new()?;
        let path = dir.path().to_path_buf();
        let mut args = vec!["clone".to_string()];
        if let Some(name) = source.name() {
            args.push("--branch".to_string());
            args.push(name);
        }
        args.push(source_url.to_string());
        args.push(path.display().to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        git_ok(None, &arg_refs).await?;
        for (from_name, to_name) in colocated {
            let refspec = format!("refs/heads/{}:refs/heads/{}", from_name, to_name);
            // Missing colocated branches on the source are skipped.
            let _ = run_git(Some(&path), &["fetch", "origin", &refspec]).await;
        }
        let url = Url::from_file_path(&path)
            .map_err(|()| Error::Vcs(format!("cannot build file url for {}", path.display())))?;
        Ok(Box::new(GitTree {
            dir: Some(dir),
            path,
            url,
        }))
    }

    async fn create_empty(&self) -> Result<Box<dyn LocalTree>> {
        let dir = TempDir::new()?;
        let path = dir.path().to_path_buf();
        git_ok(Some(&path), &["init", "--initial-branch=main"]).await?;
        let url = Url::from_file_path(&path)
            .map_err(|()| Error::Vcs(format!("cannot build file url for {}", path.display())))?;
        Ok(Box::new(GitTree {
            dir: Some(dir),
            path,
            url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_push_error() {
        assert!(matches!(
            classify_push_error("! [rejected] main -> main (non-fast-forward)"),
            Error::Diverged
        ));
        assert!(matches!(
            classify_push_error("remote: Permission denied"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_push_error("fatal: the remote end hung up"),
            Error::Vcs(_)
        ));
    }

    #[test]
    fn test_classify_open_error() {
        let url = Url::parse("https://example.com/repo").unwrap();
        assert!(matches!(
            classify_open_error(&url, "fatal: repository not found"),
            BranchOpenError::Missing { .. }
        ));
        assert!(matches!(
            classify_open_error(&url, "fatal: Could not resolve host: example.com"),
            BranchOpenError::TemporarilyUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_tree_commit_cycle() {
        let vcs = GitVcs::new();
        let tree = vcs.create_empty().await.unwrap();
        assert!(tree.last_revision().await.unwrap().is_null());
        assert!(!tree.has_changes().await.unwrap());

        tree.put_file("README", "hello\n").await.unwrap();
        assert!(tree.has_changes().await.unwrap());
        let revid = tree.commit("initial").await.unwrap();
        assert!(!revid.is_null());
        assert!(!tree.has_changes().await.unwrap());
        assert_eq!(
            tree.get_file("README").await.unwrap().as_deref(),
            Some("hello\n")
        );
        let basis = tree.basis_tree().await.unwrap();
        assert_eq!(basis.get("README"), Some("hello\n"));
    }

    #[tokio::test]
    async fn test_sprout_from_local_remote() {
        let vcs = GitVcs::new();
        let origin = vcs.create_empty().await.unwrap();
        origin.put_file("a", "1\n").await.unwrap();
        let r1 = origin.commit("one").await.unwrap();

        let origin_url = Url::from_file_path(origin.path().unwrap()).unwrap();
        let remote = vcs.open_branch(&origin_url, None).await.unwrap();
        assert_eq!(remote.last_revision().await.unwrap(), r1);

        let local = vcs.sprout(remote.as_ref(), &HashMap::new()).await.unwrap();
        assert_eq!(local.last_revision().await.unwrap(), r1);
        assert_eq!(local.get_file("a").await.unwrap().as_deref(), Some("1\n"));
    }
}
