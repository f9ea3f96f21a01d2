//! Parser engines.
//!
//! Exactly one engine is initialised per build, selected by `parse.engine`:
//!
//! - `lua` - embedded Lua 5.4, the only engine that can run hooks
//! - `toml` - declarative `[[target]]` tables
//! - `script` - the legacy line-oriented build script format
//!
//! Every engine turns a build file into [`TargetSpec`](crate::target::TargetSpec)s
//! for a [`Package`] and answers the hook calls the scheduler makes. Engines
//! that cannot run hooks fail fatally the moment one is invoked.
//!
//! # Submodules
//!
//! - [`lua`] - The Lua engine, its globals and built-in rules
//! - [`declarative`] - The TOML engine
//! - [`script`] - The legacy script engine

pub mod declarative;
pub mod lua;
pub mod script;
mod types;

pub use types::*;

use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use crate::config::{Config, Engine};
use crate::graph::{rescan_deps, resolve_package};
use crate::label::Label;
use crate::package::{Package, PackageError, PackageState};
use crate::state::{BuildState, BuildStatus, PendingTask};
use crate::target::{BuildTarget, HookError, HookKind};

/// Capabilities shared by every parser engine.
///
/// One instance is shared by all workers, so implementations must tolerate
/// concurrent calls for different packages.
pub trait Parser: Send + Sync + fmt::Debug {
  fn engine(&self) -> Engine;

  /// Evaluate `filename` and register its targets in the empty `package`.
  fn parse_file(&self, state: &BuildState, package: &Package, filename: &Path) -> Result<(), ParseError>;

  /// Run the target's pre-build hook before its action.
  fn run_pre_build_function(&self, tid: usize, state: &BuildState, target: &BuildTarget) -> Result<(), ParseError>;

  /// Run the target's post-build hook with the action's captured output.
  fn run_post_build_function(
    &self,
    tid: usize,
    state: &BuildState,
    target: &BuildTarget,
    output: &str,
  ) -> Result<(), ParseError>;

  /// Resume any package resolution that was waiting on `target`.
  fn undefer_any_parses(&self, state: &BuildState, target: &BuildTarget) {
    undefer_any_parses(state, target);
  }
}

/// Select and initialise the configured engine.
pub fn init_parser(root: &Path, config: &Config) -> Result<Box<dyn Parser>, ParseError> {
  let engine = config.engine()?;
  let parser: Box<dyn Parser> = match engine {
    Engine::Lua => Box::new(lua::LuaParser::new(root, &config.parse.preload_build_defs)?),
    Engine::Toml => Box::new(declarative::TomlParser::new(&config.parse.preload_build_defs)),
    Engine::Script => Box::new(script::ScriptParser::new(root, &config.parse.preload_build_defs)),
  };
  info!(%engine, "parser initialised");
  Ok(parser)
}

/// Run one of a target's hooks under its package's build-callback gate, then
/// rescan whatever the hook added.
///
/// Engines that can execute hooks implement both hook methods of [`Parser`]
/// with this. Failures are reported against the target before being
/// returned.
pub fn run_build_function(
  tid: usize,
  state: &BuildState,
  target: &BuildTarget,
  kind: HookKind,
  output: Option<&str>,
) -> Result<(), ParseError> {
  let hook = match kind {
    HookKind::PreBuild => target.pre_build(),
    HookKind::PostBuild => target.post_build(),
  };
  let Some(hook) = hook else {
    return Ok(());
  };

  let label = target.label();
  state.log_build_result(
    tid,
    label,
    BuildStatus::PackageParsing,
    format!("Running {}-build function for {label}", kind.as_str()),
  );

  let result = enter_and_rescan(tid, state, target, kind, |editor| {
    hook.call(target, output, editor).map_err(|err| match err {
      HookError::Unsupported(name) => ParseError::NotImplemented {
        engine: state.engine(),
        feature: format!("{kind} function '{name}'"),
        label: label.clone(),
      },
      source => ParseError::Hook {
        label: label.clone(),
        kind,
        source,
      },
    })
  });

  match &result {
    Ok(()) => state.log_build_result(
      tid,
      label,
      BuildStatus::TargetBuilding,
      format!("Finished {}-build function for {label}", kind.as_str()),
    ),
    Err(err) => state.log_build_error(
      tid,
      label,
      BuildStatus::ParseFailed,
      err,
      format!("Failed {}-build function for {label}", kind.as_str()),
    ),
  }
  result
}

fn enter_and_rescan<F>(tid: usize, state: &BuildState, target: &BuildTarget, kind: HookKind, f: F) -> Result<(), ParseError>
where
  F: FnOnce(&mut crate::package::PackageEditor<'_>) -> Result<(), ParseError>,
{
  let label = target.label();
  let pkg = state
    .graph()
    .package(label.package())
    .ok_or_else(|| PackageError::UnknownTarget {
      package: label.package().to_string(),
      name: label.name().to_string(),
    })?;

  let outcome = pkg.enter_build_callback(state.graph(), label, f)?;
  target.mark_hook_ran(kind);
  if outcome.changed() {
    rescan_deps(tid, state, target, &outcome)?;
  }
  Ok(())
}

/// Report that `kind` hooks cannot run on this engine and build the fatal
/// error for it.
pub(crate) fn hook_not_implemented(tid: usize, state: &BuildState, target: &BuildTarget, kind: HookKind) -> ParseError {
  let err = ParseError::NotImplemented {
    engine: state.engine(),
    feature: format!("{kind} function"),
    label: target.label().clone(),
  };
  state.log_build_error(
    tid,
    target.label(),
    BuildStatus::ParseFailed,
    &err,
    format!("Failed {}-build function for {}", kind.as_str(), target.label()),
  );
  err
}

/// Hand every package waiting on `target` back to the scheduler.
///
/// Each waiting package is queued exactly once; a package that starts
/// waiting on `target` after this call is not parked at all.
pub fn undefer_any_parses(state: &BuildState, target: &BuildTarget) -> usize {
  let label = target.label();
  let packages = state.deferred().undefer(label);
  for package in &packages {
    debug!(package = %package, unblocked_by = %label, "undeferring package");
    state.enqueue(PendingTask::ResumeParse {
      package: package.clone(),
      unblocked_by: label.clone(),
    });
  }
  packages.len()
}

/// Parse `pkg` with the state's engine and resolve its dependencies.
///
/// Returns `Ok` without doing anything if the package was already claimed by
/// another parse. Failures are reported against the package.
pub fn parse_package(tid: usize, state: &BuildState, pkg: &Package) -> Result<(), ParseError> {
  if pkg.begin_parse().is_err() {
    return Ok(());
  }

  let label = pkg.label();
  state.log_build_result(tid, &label, BuildStatus::PackageParsing, format!("Parsing //{}", pkg.path()));

  if let Err(err) = parse_into(state, pkg) {
    pkg.set_state(PackageState::Failed);
    state.log_build_error(
      tid,
      &label,
      BuildStatus::ParseFailed,
      &err,
      format!("Failed to parse //{}", pkg.path()),
    );
    return Err(err);
  }

  pkg.set_state(PackageState::Parsed);
  state.log_build_result(
    tid,
    &label,
    BuildStatus::PackageParsed,
    format!("Parsed //{} ({} targets)", pkg.path(), pkg.len()),
  );

  resolve_package(tid, state, pkg)?;
  Ok(())
}

fn parse_into(state: &BuildState, pkg: &Package) -> Result<(), ParseError> {
  let file = state.find_build_file(pkg.path()).ok_or_else(|| ParseError::NoBuildFile {
    package: pkg.path().to_string(),
    names: state.config().build_file_names(state.engine()),
  })?;
  pkg.set_build_file(&file);
  state.parser().parse_file(state, pkg, &file)
}

/// Resolve a deferred package again after `unblocked_by` ran its hook.
pub fn resume_parse(tid: usize, state: &BuildState, pkg: &Package, unblocked_by: &Label) -> Result<(), ParseError> {
  state.log_build_result(
    tid,
    &pkg.label(),
    BuildStatus::ParseResumed,
    format!("Resuming //{} after {unblocked_by}", pkg.path()),
  );
  resolve_package(tid, state, pkg)?;
  Ok(())
}
