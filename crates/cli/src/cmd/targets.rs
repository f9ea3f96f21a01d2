//! Implementation of the `kiln targets` command.

use std::path::Path;

use anyhow::{Context, Result};

use kiln_lib::parse::parse_package;
use kiln_lib::state::BuildState;

use super::load_config;
use crate::output::{OutputFormat, print_json, symbols};

/// Parse each package and list its targets with their dependencies.
///
/// Only the named packages are parsed. Dependencies on other packages are
/// listed by label without loading them.
pub fn cmd_targets(root: &Path, config: Option<&Path>, packages: &[String], format: OutputFormat) -> Result<bool> {
  let config = load_config(root, config)?;
  let state = BuildState::new(root, config).context("Failed to initialize build")?;

  let mut listed = Vec::new();
  for path in packages {
    let path = path.trim_start_matches("//").trim_end_matches('/');
    let (pkg, _) = state.graph().get_or_create_package(path);
    parse_package(0, &state, &pkg).with_context(|| format!("Failed to parse //{}", path))?;
    listed.push(pkg);
  }

  if format.is_json() {
    let items: Vec<_> = listed
      .iter()
      .flat_map(|pkg| pkg.targets())
      .map(|target| {
        serde_json::json!({
          "label": target.label(),
          "deps": target.deps(),
          "outs": target.outs(),
          "cmd": target.cmd(),
          "pre_build": target.pre_build().is_some(),
          "post_build": target.post_build().is_some(),
        })
      })
      .collect();
    print_json(&items)?;
    return Ok(true);
  }

  for pkg in &listed {
    println!("//{} ({} targets)", pkg.path(), pkg.len());
    for target in pkg.targets() {
      let mut line = format!("  {} {}", symbols::INFO, target.label());
      let deps = target.deps();
      if !deps.is_empty() {
        let deps: Vec<String> = deps.iter().map(ToString::to_string).collect();
        line.push_str(&format!(" {} {}", symbols::ARROW, deps.join(", ")));
      }
      println!("{}", line);
    }
  }

  Ok(true)
}
