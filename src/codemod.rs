//! Change producers: the pluggable step that edits a working tree.
//!
//! The built-in [`ScriptChanger`] runs an external command inside the
//! working copy and speaks a small JSON protocol with it. Every producer
//! reports a tagged [`ChangeOutcome`] rather than signalling "no changes"
//! or "script failed" through the error channel, so callers can branch on
//! the three cases directly.

use crate::error::{Error, Result};
use crate::types::RevisionId;
use crate::vcs::LocalTree;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use url::Url;

/// What a successful change run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeResult {
    /// Human-readable description, used as the proposal body.
    pub description: Option<String>,
    /// Commit message override for the eventual merge.
    pub commit_message: Option<String>,
    /// Proposal title override.
    pub title: Option<String>,
    /// Producer-assigned value, for prioritizing across targets.
    pub value: Option<u32>,
    /// Opaque context carried into the next resume of this target.
    pub context: Option<serde_json::Value>,
    /// Tags to publish alongside the branch; `None` deletes the tag.
    pub tags: HashMap<String, Option<RevisionId>>,
    /// Override of the branch to propose against.
    pub target_branch_url: Option<Url>,
    /// Tip before the producer ran.
    pub old_revision: RevisionId,
    /// Tip after the producer ran.
    pub new_revision: RevisionId,
}

/// The three ways a change run can end.
#[derive(Debug)]
pub enum ChangeOutcome {
    /// The tree now carries new commits.
    Success(ChangeResult),
    /// The producer ran cleanly but the branch is unchanged.
    NoChanges,
    /// The producer reported a failure of its own.
    Failed {
        /// Producer-supplied reason.
        reason: String,
    },
}

/// Something that edits a working tree.
#[async_trait]
pub trait ChangeProducer: Send + Sync {
    /// Apply changes to `tree`, committing them.
    async fn apply(&self, tree: &dyn LocalTree) -> Result<ChangeOutcome>;
}

/// Whether to commit changes the script left uncommitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPending {
    /// Commit them only when the script made no commits of its own.
    #[default]
    Auto,
    /// Always commit them.
    Yes,
    /// Never; uncommitted changes are discarded with the workspace.
    No,
}

/// Result document a script may leave behind on success.
#[derive(Debug, Deserialize, Serialize, Default)]
struct ScriptResult {
    description: Option<String>,
    #[serde(rename = "commit-message")]
    commit_message: Option<String>,
    title: Option<String>,
    value: Option<u32>,
    context: Option<serde_json::Value>,
    tags: Option<HashMap<String, Option<String>>>,
    #[serde(rename = "target-branch-url")]
    target_branch_url: Option<Url>,
}

/// Result document a script may leave behind on failure.
#[derive(Debug, Deserialize, Serialize)]
struct ScriptFailure {
    result_code: String,
    description: Option<String>,
}

/// Runs a shell command inside the working copy.
///
/// The command gets `AUTOPROP_API=1` in its environment and may write a
/// JSON result document to the path named by `AUTOPROP_RESULT`. When
/// resuming earlier work, the previous context document is made available
/// at the path named by `AUTOPROP_RESUME`.
pub struct ScriptChanger {
    command: String,
    subpath: Option<PathBuf>,
    commit_pending: CommitPending,
    resume_metadata: Option<serde_json::Value>,
    extra_env: HashMap<String, String>,
}

impl ScriptChanger {
    /// Changer for a shell command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            subpath: None,
            commit_pending: CommitPending::default(),
            resume_metadata: None,
            extra_env: HashMap::new(),
        }
    }

    /// Run the command in a subdirectory of the working copy.
    pub fn subpath(mut self, subpath: impl Into<PathBuf>) -> Self {
        self.subpath = Some(subpath.into());
        self
    }

    /// Control committing of uncommitted script output.
    pub fn commit_pending(mut self, commit_pending: CommitPending) -> Self {
        self.commit_pending = commit_pending;
        self
    }

    /// Context from the previous run of this target.
    pub fn resume_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.resume_metadata = metadata;
        self
    }

    /// Extra environment variables for the command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// The command line.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl ChangeProducer for ScriptChanger {
    async fn apply(&self, tree: &dyn LocalTree) -> Result<ChangeOutcome> {
        let base = tree.path().ok_or(Error::NoWorkingCopyPath)?;
        let cwd = match &self.subpath {
            Some(sub) => base.join(sub),
            None => base,
        };
        let last_revision = tree.last_revision().await?;

        let scratch = tempfile::tempdir()?;
        let result_path = scratch.path().join("result.json");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env("AUTOPROP_API", "1")
            .env("AUTOPROP_RESULT", &result_path)
            .envs(&self.extra_env);
        if let Some(metadata) = &self.resume_metadata {
            let resume_path = scratch.path().join("resume.json");
            tokio::fs::write(&resume_path, serde_json::to_vec(metadata)?).await?;
            cmd.env("AUTOPROP_RESUME", &resume_path);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            let reason = match tokio::fs::read_to_string(&result_path).await {
                Ok(doc) => {
                    let failure: ScriptFailure = serde_json::from_str(&doc)?;
                    match failure.description {
                        Some(desc) => format!("{}: {}", failure.result_code, desc),
                        None => failure.result_code,
                    }
                }
                Err(_) => format!(
                    "command exited with code {}",
                    output.status.code().unwrap_or(1)
                ),
            };
            return Ok(ChangeOutcome::Failed { reason });
        }

        let mut result: ScriptResult = match tokio::fs::read_to_string(&result_path).await {
            Ok(doc) => serde_json::from_str(&doc)?,
            Err(_) => ScriptResult::default(),
        };
        if result.description.is_none() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !stdout.is_empty() {
                result.description = Some(stdout);
            }
        }

        let tip_after_script = tree.last_revision().await?;
        let commit_pending = match self.commit_pending {
            CommitPending::Auto => tip_after_script == last_revision,
            CommitPending::Yes => true,
            CommitPending::No => false,
        };
        let mut new_revision = tip_after_script;
        if commit_pending && tree.has_changes().await? {
            let message = result
                .description
                .as_deref()
                .unwrap_or("Apply automated changes");
            new_revision = tree.commit(message).await?;
        }

        if new_revision == last_revision {
            return Ok(ChangeOutcome::NoChanges);
        }

        let tags = result
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|(name, revid)| (name, revid.map(RevisionId::from)))
            .collect();

        Ok(ChangeOutcome::Success(ChangeResult {
            description: result.description,
            commit_message: result.commit_message,
            title: result.title,
            value: result.value,
            context: result.context,
            tags,
            target_branch_url: result.target_branch_url,
            old_revision: last_revision,
            new_revision,
        }))
    }
}
