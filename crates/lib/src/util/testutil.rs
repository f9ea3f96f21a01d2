//! Test utilities for kiln-lib.
//!
//! Hooks built from closures and a [`BuildState`] that never touches the
//! filesystem.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, Engine};
use crate::package::{Package, PackageEditor};
use crate::parse::{ParseError, Parser, run_build_function};
use crate::state::BuildState;
use crate::target::{BuildHook, BuildTarget, Hook, HookError, HookKind};

type HookFn = dyn Fn(&BuildTarget, Option<&str>, &mut PackageEditor<'_>) -> Result<(), HookError> + Send + Sync;

/// A hook whose body is a Rust closure.
pub struct FnHook {
  body: Box<HookFn>,
}

impl FnHook {
  #[allow(clippy::new_ret_no_self)]
  pub fn new<F>(body: F) -> Hook
  where
    F: Fn(&BuildTarget, Option<&str>, &mut PackageEditor<'_>) -> Result<(), HookError> + Send + Sync + 'static,
  {
    Arc::new(Self { body: Box::new(body) })
  }
}

impl fmt::Debug for FnHook {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnHook").finish_non_exhaustive()
  }
}

impl BuildHook for FnHook {
  fn call(&self, target: &BuildTarget, output: Option<&str>, editor: &mut PackageEditor<'_>) -> Result<(), HookError> {
    (self.body)(target, output, editor)
  }
}

/// A hook that succeeds without touching anything.
pub fn noop_hook() -> Hook {
  FnHook::new(|_, _, _| Ok(()))
}

/// Engine that never reads build files; packages are populated by hand.
#[derive(Debug)]
struct StubParser;

impl Parser for StubParser {
  fn engine(&self) -> Engine {
    Engine::Lua
  }

  fn parse_file(&self, _state: &BuildState, _package: &Package, _filename: &Path) -> Result<(), ParseError> {
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
    run_build_function(tid, state, target, HookKind::PostBuild, Some(output))
  }
}

pub fn stub_state() -> BuildState {
  stub_state_with(Config::default())
}

pub fn stub_state_with(config: Config) -> BuildState {
  BuildState::with_parser("/tmp/kiln-test", config, Box::new(StubParser))
}
