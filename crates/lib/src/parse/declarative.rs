//! The TOML parser engine.
//!
//! ```toml
//! [[target]]
//! name = "gen"
//! deps = [":tool"]
//! outs = ["gen.h"]
//! cmd = "tool > gen.h"
//! post_build = "scan_headers"
//! ```
//!
//! Hook entries are recorded by name so the file still parses, but this
//! engine cannot execute them: running one is a fatal error.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use super::{ParseError, Parser, hook_not_implemented};
use crate::config::Engine;
use crate::package::Package;
use crate::state::BuildState;
use crate::target::{BuildTarget, DeclaredHook, Hook, HookKind, TargetSpec};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFile {
  #[serde(default)]
  target: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetEntry {
  name: String,
  #[serde(default)]
  deps: Vec<String>,
  #[serde(default)]
  outs: Vec<String>,
  cmd: Option<String>,
  pre_build: Option<String>,
  post_build: Option<String>,
}

impl From<TargetEntry> for TargetSpec {
  fn from(entry: TargetEntry) -> Self {
    let mut spec = TargetSpec::new(&entry.name).with_deps(entry.deps).with_outs(entry.outs);
    spec.cmd = entry.cmd;
    spec.pre_build = entry.pre_build.map(|name| -> Hook { Arc::new(DeclaredHook::new(&name)) });
    spec.post_build = entry.post_build.map(|name| -> Hook { Arc::new(DeclaredHook::new(&name)) });
    spec
  }
}

#[derive(Debug)]
pub struct TomlParser;

impl TomlParser {
  pub fn new(preload_build_defs: &[PathBuf]) -> Self {
    if !preload_build_defs.is_empty() {
      warn!(count = preload_build_defs.len(), "the toml engine ignores preload_build_defs");
    }
    Self
  }
}

impl Parser for TomlParser {
  fn engine(&self) -> Engine {
    Engine::Toml
  }

  fn parse_file(&self, _state: &BuildState, package: &Package, filename: &Path) -> Result<(), ParseError> {
    let content = fs::read_to_string(filename).map_err(|source| ParseError::Io {
      path: filename.to_path_buf(),
      source,
    })?;
    let file: BuildFile = toml::from_str(&content).map_err(|e| ParseError::Toml {
      path: filename.to_path_buf(),
      source: Box::new(e),
    })?;
    package.populate(file.target.into_iter().map(TargetSpec::from).collect())?;
    Ok(())
  }

  fn run_pre_build_function(&self, tid: usize, state: &BuildState, target: &BuildTarget) -> Result<(), ParseError> {
    Err(hook_not_implemented(tid, state, target, HookKind::PreBuild))
  }

  fn run_post_build_function(
    &self,
    tid: usize,
    state: &BuildState,
    target: &BuildTarget,
    _output: &str,
  ) -> Result<(), ParseError> {
    Err(hook_not_implemented(tid, state, target, HookKind::PostBuild))
  }
}
