//! Error types.
//!
//! Every failure category the batch layer needs to distinguish gets its own
//! variant; [`Error::kind`] gives a stable label for per-run statistics.

use thiserror::Error;
use url::Url;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while opening a branch by URL.
///
/// These are kept separate from [`Error`] because batch callers treat them
/// as per-target, usually transient conditions.
#[derive(Debug, Error)]
pub enum BranchOpenError {
    /// No branch exists at the URL.
    #[error("missing branch {url}: {description}")]
    Missing {
        /// Branch URL.
        url: Url,
        /// Backend description of the failure.
        description: String,
    },

    /// The branch exists but cannot be reached right now.
    #[error("branch unavailable {url}: {description}")]
    Unavailable {
        /// Branch URL.
        url: Url,
        /// Backend description of the failure.
        description: String,
    },

    /// The branch is unreachable due to a transient condition (DNS, outage).
    #[error("branch temporarily unavailable {url}: {description}")]
    TemporarilyUnavailable {
        /// Branch URL.
        url: Url,
        /// Backend description of the failure.
        description: String,
    },

    /// The host is rate-limiting us.
    #[error("rate limited {url}: {description} (retry after {retry_after:?})")]
    RateLimited {
        /// Branch URL.
        url: Url,
        /// Backend description of the failure.
        description: String,
        /// Scheduler hint, in seconds.
        retry_after: Option<f64>,
    },

    /// No registered backend understands the URL.
    #[error("unsupported VCS for {url}: {description}")]
    Unsupported {
        /// Branch URL.
        url: Url,
        /// Backend description of the failure.
        description: String,
        /// The VCS kind, when it could be determined.
        vcs: Option<String>,
    },
}

impl BranchOpenError {
    /// Stable label for statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "branch-missing",
            Self::Unavailable { .. } => "branch-unavailable",
            Self::TemporarilyUnavailable { .. } => "branch-temporarily-unavailable",
            Self::RateLimited { .. } => "branch-rate-limited",
            Self::Unsupported { .. } => "branch-unsupported",
        }
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The local and target branches have each grown commits the other lacks.
    #[error("branches have diverged")]
    Diverged,

    /// Merging the local branch into the target would change nothing.
    #[error("merge proposal would be empty")]
    EmptyMergeProposal,

    /// Proposal creation is disallowed and there is no existing branch to
    /// resume; a configuration condition, not an absence of work.
    #[error("insufficient changes for a new merge proposal")]
    InsufficientChangesForNewProposal,

    /// The remote side refused a write.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No forge is known for the host; tolerated only in push mode.
    #[error("unsupported forge: {0}")]
    UnsupportedForge(Url),

    /// The forge cannot perform the requested proposal operation.
    #[error("operation not supported by this forge: {0}")]
    UnsupportedOperation(String),

    /// No branch exists where one was looked up (e.g. a derived branch).
    #[error("not a branch: {0}")]
    NotBranch(Url),

    /// A proposal already exists for this branch pair; carries its URL so
    /// the caller can adopt it.
    #[error("merge proposal already exists: {0}")]
    ProposalExists(Url),

    /// Neither a target branch nor a main branch was supplied.
    #[error("no target branch")]
    NoTargetBranch,

    /// Opening a branch failed.
    #[error(transparent)]
    BranchOpen(#[from] BranchOpenError),

    /// A forge API call failed.
    #[error("forge error: {0}")]
    Forge(String),

    /// A VCS backend operation failed.
    #[error("vcs error: {0}")]
    Vcs(String),

    /// The change producer failed.
    #[error("changer failed: {0}")]
    Changer(String),

    /// An operation that needs a filesystem working copy was run against a
    /// backend without one.
    #[error("no filesystem working copy available")]
    NoWorkingCopyPath,

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed JSON (batch state, script result documents).
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Malformed TOML (candidates file).
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable label for per-run statistics, grouped the way the batch layer
    /// reports them.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Diverged => "diverged",
            Self::EmptyMergeProposal => "empty-merge-proposal",
            Self::InsufficientChangesForNewProposal => "insufficient-changes",
            Self::PermissionDenied(_) => "permission-denied",
            Self::UnsupportedForge(_) => "unsupported-forge",
            Self::UnsupportedOperation(_) => "unsupported-operation",
            Self::NotBranch(_) => "not-branch",
            Self::ProposalExists(_) => "proposal-exists",
            Self::NoTargetBranch => "no-target-branch",
            Self::BranchOpen(e) => e.kind(),
            Self::Forge(_) => "forge",
            Self::Vcs(_) => "vcs",
            Self::Changer(_) => "changer",
            Self::NoWorkingCopyPath => "no-working-copy-path",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Toml(_) => "toml",
            Self::Other(_) => "other",
        }
    }
}
