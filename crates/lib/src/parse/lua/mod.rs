//! The Lua parser engine.
//!
//! Each build file is evaluated in a fresh Lua VM, so distinct packages
//! parse concurrently without sharing interpreter state. Built-in rules and
//! configured preloads run in every VM before the build file itself. The VM
//! outlives the parse only through the hook functions it declared.
//!
//! # Submodules
//!
//! - [`globals`] - `target{}` and `package_name()`
//! - [`hooks`] - Lua hook functions and their `ctx` userdata

pub mod globals;
pub mod hooks;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::prelude::*;
use tracing::debug;

use super::{ParseError, Parser, run_build_function};
use crate::config::{ConfigError, Engine};
use crate::package::Package;
use crate::state::BuildState;
use crate::target::{BuildTarget, HookKind};
use crate::util::sync::lock;

const BUILTIN_RULES: &str = include_str!("builtins/rules.lua");

/// A chunk of Lua run before every build file.
#[derive(Debug, Clone)]
struct Chunk {
  name: String,
  path: PathBuf,
  source: String,
}

#[derive(Debug)]
pub struct LuaParser {
  preloads: Vec<Chunk>,
}

impl LuaParser {
  /// Read the built-in rules and every preload once, up front.
  ///
  /// A preload that is missing or does not compile is a fatal configuration
  /// error.
  pub fn new(root: &Path, preload_build_defs: &[PathBuf]) -> Result<Self, ParseError> {
    let mut preloads = vec![Chunk {
      name: "=builtins/rules.lua".to_string(),
      path: PathBuf::from("builtins/rules.lua"),
      source: BUILTIN_RULES.to_string(),
    }];

    let checker = Lua::new();
    for preload in preload_build_defs {
      let path = root.join(preload);
      debug!(path = %path.display(), "preloading build defs");
      let source = fs::read_to_string(&path).map_err(|source| ConfigError::Preload {
        path: path.clone(),
        source,
      })?;
      let name = format!("@{}", path.display());
      checker
        .load(&source)
        .set_name(&name)
        .into_function()
        .map_err(|e| ConfigError::InvalidPreload {
          path: path.clone(),
          message: e.to_string(),
        })?;
      preloads.push(Chunk { name, path, source });
    }

    Ok(Self { preloads })
  }

  fn evaluate(&self, package: &Package, filename: &Path) -> Result<Vec<crate::target::TargetSpec>, ParseError> {
    let source = fs::read_to_string(filename).map_err(|source| ParseError::Io {
      path: filename.to_path_buf(),
      source,
    })?;

    let declared: globals::Declared = Arc::default();
    let lua = Lua::new();
    globals::register_globals(&lua, package.path(), Arc::clone(&declared)).map_err(|source| ParseError::Lua {
      path: filename.to_path_buf(),
      source,
    })?;

    for chunk in &self.preloads {
      lua
        .load(&chunk.source)
        .set_name(&chunk.name)
        .exec()
        .map_err(|source| ParseError::Lua {
          path: chunk.path.clone(),
          source,
        })?;
    }

    lua
      .load(&source)
      .set_name(format!("@{}", filename.display()))
      .exec()
      .map_err(|source| ParseError::Lua {
        path: filename.to_path_buf(),
        source,
      })?;

    Ok(std::mem::take(&mut *lock(&declared)))
  }
}

impl Parser for LuaParser {
  fn engine(&self) -> Engine {
    Engine::Lua
  }

  fn parse_file(&self, _state: &BuildState, package: &Package, filename: &Path) -> Result<(), ParseError> {
    let specs = self.evaluate(package, filename)?;
    debug!(package = package.path(), targets = specs.len(), "evaluated build file");
    package.populate(specs)?;
    Ok(())
  }

  fn run_pre_build_function(&self, tid: usize, state: &BuildState, target: &BuildTarget) -> Result<(), ParseError> {
    run_build_function(tid, state, target, HookKind::PreBuild, None)
  }

  fn run_post_build_function(
    &self,
    tid: usize,
    state: &BuildState,
    target: &BuildTarget,
    output: &str,
  ) -> Result<(), ParseError> {
    debug!(target_label = %target.label(), "running post-build function, build output:\n{output}");
    run_build_function(tid, state, target, HookKind::PostBuild, Some(output))
  }
}
