use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::hook::Hook;
use crate::label::Label;

/// Lifecycle of a build target.
///
/// ```text
/// Declared -> ParsingDeps -> (PreBuild) -> Building -> (PostBuild) -> Done
/// ```
///
/// `Failed` is reachable from every non-terminal state. A hook that adds
/// dependencies which are not built yet sends the target back to
/// `ParsingDeps` until they are, as does a dependency that a sibling's hook
/// added just before the target left `ParsingDeps`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum TargetState {
  #[default]
  Declared,
  ParsingDeps,
  PreBuild,
  Building,
  PostBuild,
  Done,
  Failed,
}

impl TargetState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TargetState::Done | TargetState::Failed)
  }

  /// Whether the target has left `ParsingDeps` for good or for now. Only the
  /// target's own hooks may add dependencies to it from here on.
  pub fn has_started(self) -> bool {
    matches!(
      self,
      TargetState::PreBuild | TargetState::Building | TargetState::PostBuild | TargetState::Done
    )
  }

  /// Whether the package gate may be held on this target's behalf.
  pub fn holds_gate(self) -> bool {
    matches!(self, TargetState::PreBuild | TargetState::PostBuild)
  }

  pub fn can_transition_to(self, next: TargetState) -> bool {
    use TargetState::*;

    if next == Failed {
      return !self.is_terminal();
    }

    matches!(
      (self, next),
      (Declared, ParsingDeps)
        | (ParsingDeps, PreBuild)
        | (ParsingDeps, Building)
        | (ParsingDeps, Done)
        | (PreBuild, Building)
        | (PreBuild, ParsingDeps)
        | (Building, ParsingDeps)
        | (Building, PostBuild)
        | (Building, Done)
        | (PostBuild, Done)
        | (PostBuild, ParsingDeps)
    )
  }
}

impl fmt::Display for TargetState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TargetState::Declared => "declared",
      TargetState::ParsingDeps => "parsing-dependencies",
      TargetState::PreBuild => "pre-build",
      TargetState::Building => "building",
      TargetState::PostBuild => "post-build",
      TargetState::Done => "done",
      TargetState::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid state transition for {label}: {from} -> {to}")]
pub struct StateError {
  pub label: Label,
  pub from: TargetState,
  pub to: TargetState,
}

/// Engine-neutral declaration of a target, as produced by a parser engine or
/// by a hook adding a target at build time.
///
/// Dependencies are kept as written: either labels (`//pkg:name`, `:name`) or
/// output files of another target in the same package.
#[derive(Debug, Clone, Default)]
pub struct TargetSpec {
  pub name: String,
  pub deps: Vec<String>,
  pub outs: Vec<String>,
  pub cmd: Option<String>,
  pub pre_build: Option<Hook>,
  pub post_build: Option<Hook>,
}

impl TargetSpec {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Default::default()
    }
  }

  pub fn with_deps<I, S>(mut self, deps: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.deps.extend(deps.into_iter().map(Into::into));
    self
  }

  pub fn with_outs<I, S>(mut self, outs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.outs.extend(outs.into_iter().map(Into::into));
    self
  }

  pub fn with_cmd(mut self, cmd: &str) -> Self {
    self.cmd = Some(cmd.to_string());
    self
  }

  pub fn with_pre_build(mut self, hook: Hook) -> Self {
    self.pre_build = Some(hook);
    self
  }

  pub fn with_post_build(mut self, hook: Hook) -> Self {
    self.post_build = Some(hook);
    self
  }
}
