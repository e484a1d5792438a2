//! CLI commands
//!
//! Command implementations for the `autoprop` binary.

mod batch;
mod run;
mod style;

pub use batch::{run_batch_cmd, BatchArgs};
pub use run::{run_run, RunArgs};
