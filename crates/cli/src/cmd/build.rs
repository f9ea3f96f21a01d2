//! Implementation of the `kiln build` command.
//!
//! Loads configuration, runs the scheduler over the requested labels with a
//! [`ShellRunner`], and reports what was built, failed, skipped or stalled.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use kiln_lib::build::{BuildSummary, ShellRunner, build};
use kiln_lib::label::Label;
use kiln_lib::state::BuildState;

use super::load_config;
use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_stat, print_success, print_warning,
};

pub struct BuildArgs {
  pub labels: Vec<String>,
  pub jobs: Option<usize>,
  pub fail_fast: bool,
}

/// Execute the build command.
///
/// Returns `Ok(false)` when the build ran to completion but some target did
/// not build. Fatal errors abort the build and are returned as `Err`.
pub fn cmd_build(root: &Path, config: Option<&Path>, args: BuildArgs, format: OutputFormat) -> Result<bool> {
  let mut config = load_config(root, config)?;
  if let Some(jobs) = args.jobs {
    config.build.parallelism = jobs.max(1);
  }
  if args.fail_fast {
    config.build.fail_fast = true;
  }

  let labels = args
    .labels
    .iter()
    .map(|s| Label::parse_relative(s, "").with_context(|| format!("Invalid label: {}", s)))
    .collect::<Result<Vec<_>>>()?;

  let runner = Arc::new(ShellRunner::new(config.build.shell.clone()));
  let state = Arc::new(BuildState::new(root, config).context("Failed to initialize build")?);

  info!(targets = labels.len(), "starting build");
  let started = Instant::now();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let summary = rt
    .block_on(build(Arc::clone(&state), runner, &labels))
    .context("Build aborted")?;

  if format.is_json() {
    print_json(&summary)?;
  } else {
    print_summary(&state, &summary);
    println!();
    print_stat("Built", &summary.built.len().to_string());
    print_stat("Failed", &summary.failed.len().to_string());
    print_stat("Skipped", &summary.skipped.len().to_string());
    print_stat("Time", &format_duration(started.elapsed()));
  }

  Ok(summary.is_success())
}

fn print_summary(state: &BuildState, summary: &BuildSummary) {
  for label in &summary.built {
    print_success(&format!("Built {}", label));
  }

  for label in &summary.failed {
    let reason = state.events_for(label).into_iter().rev().find_map(|event| event.error);
    match reason {
      Some(reason) => print_error(&format!("Failed {}: {}", label, reason)),
      None => print_error(&format!("Failed {}", label)),
    }
  }

  for label in &summary.skipped {
    print_warning(&format!("Skipped {}", label));
  }

  for stalled in &summary.stalled {
    print_warning(&format!("Stalled {}", stalled));
  }

  if summary.built.is_empty() && summary.failed.is_empty() && summary.skipped.is_empty() {
    print_info("Nothing to build");
  }
}
