//! kiln-lib: the build graph core of kiln.
//!
//! Build files are evaluated by one of several parser engines into targets
//! grouped by package. Targets are linked into a single dependency graph that
//! may keep growing while the build runs: pre- and post-build hooks can add
//! targets, dependencies and outputs to their own package. The pieces:
//!
//! - [`label`]: `//package:name` target addresses
//! - [`target`] / [`package`]: graph nodes, and the per-package gate through
//!   which hooks mutate them
//! - [`graph`]: the dependency DAG, cycle detection and dependency rescans
//! - [`deferred`]: packages parked until a post-build hook has run
//! - [`parse`]: the `lua`, `toml` and `script` engines
//! - [`state`]: process-wide build state and the result log
//! - [`build`]: the tokio scheduler that drives all of the above

pub mod build;
pub mod config;
pub mod deferred;
pub mod graph;
pub mod label;
pub mod package;
pub mod parse;
pub mod state;
pub mod target;
mod util;
