//! autoprop - apply scripted changes to repositories and publish them
//!
//! Core library for reconciling a local work branch against a remote main
//! branch, running a change-producing command over it, and publishing the
//! result as a push or a merge proposal.
//!
//! The main entry points are [`workspace::Workspace`] for branch
//! reconciliation, [`publish::publish_changes`] for the publish state
//! machine, and [`run::apply_and_publish`] for the whole pipeline.

pub mod batch;
pub mod candidates;
pub mod codemod;
pub mod error;
pub mod forge;
pub mod publish;
pub mod run;
pub mod types;
pub mod vcs;
pub mod workspace;

pub use error::{Error, Result};
pub use types::{Mode, RevisionId};
