//! Candidate lists: the repositories a batch run iterates over.

use crate::error::Result;
use crate::types::Mode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// One repository to run against.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Candidate {
    /// URL of the repository.
    pub url: Url,

    /// Short name; defaults to the last URL segment.
    pub name: Option<String>,

    /// Branch to target instead of the default branch.
    pub branch: Option<String>,

    /// Subdirectory to run the changer in.
    pub subpath: Option<std::path::PathBuf>,

    /// Publish mode override for this candidate.
    #[serde(rename = "default-mode")]
    pub default_mode: Option<Mode>,
}

impl Candidate {
    /// The candidate's short name, derived from the URL when unset.
    pub fn shortname(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .map(|s| s.trim_end_matches(".git").to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct CandidateFile {
    #[serde(default)]
    candidate: Vec<Candidate>,
}

/// A parsed candidates file.
#[derive(Debug, Clone, Default)]
pub struct Candidates(Vec<Candidate>);

impl Candidates {
    /// An empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Load candidates from a TOML file with `[[candidate]]` tables.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: CandidateFile = toml::from_str(&text)?;
        Ok(Self(file.candidate))
    }

    /// The candidates, in file order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.0
    }

    /// Iterate over the candidates.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.0.iter()
    }
}

impl From<Vec<Candidate>> for Candidates {
    fn from(candidates: Vec<Candidate>) -> Self {
        Self(candidates)
    }
}
