//! Core value types shared across the crate.

use serde::{Deserialize, Serialize};

/// An opaque revision identifier.
///
/// Revision ids are only comparable for equality; ordering between revisions
/// is an ancestry query on the repository graph, never derived from the id
/// itself. The null id denotes a branch with no history yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionId(String);

impl RevisionId {
    /// The id of "no revision at all" - an empty branch points here.
    pub fn null() -> Self {
        Self("null:".to_string())
    }

    /// Whether this is the null revision.
    pub fn is_null(&self) -> bool {
        self.0 == "null:"
    }

    /// View the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RevisionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How changes should be published.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Push directly to the target branch.
    #[serde(rename = "push")]
    Push,

    /// Create or update a merge proposal.
    #[serde(rename = "propose")]
    Propose,

    /// Try to push to the target branch, falling back to a proposal when
    /// push access is denied.
    #[serde(rename = "attempt-push")]
    #[default]
    AttemptPush,

    /// Push to a derived branch under the forge's ownership rules, without
    /// opening a proposal.
    #[serde(rename = "push-derived")]
    PushDerived,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Push => "push",
            Mode::Propose => "propose",
            Mode::AttemptPush => "attempt-push",
            Mode::PushDerived => "push-derived",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Mode::Push),
            "propose" => Ok(Mode::Propose),
            "attempt" | "attempt-push" => Ok(Mode::AttemptPush),
            "push-derived" => Ok(Mode::PushDerived),
            _ => Err(format!("unknown mode: {}", s)),
        }
    }
}

/// Derive a branch name from a changer command line.
///
/// `./scripts/fix-typos.py --verbose` becomes `fix-typos`.
pub fn derived_branch_name(command: &str) -> &str {
    let first_word = command.split(' ').next().unwrap_or("");
    let stem = std::path::Path::new(first_word)
        .file_stem()
        .unwrap_or_default();
    stem.to_str().unwrap_or("")
}
