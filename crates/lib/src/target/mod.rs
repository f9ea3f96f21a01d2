//! Build targets.
//!
//! A target is one node of the build graph. It is owned by its package and
//! referenced everywhere else by [`Label`]. Dependencies and outputs only ever
//! grow, and only through a package's build-callback gate (see
//! [`crate::package::Package::enter_build_callback`]).
//!
//! # Submodules
//!
//! - [`hook`] - Pre/post-build hook trait and errors
//! - `types` - Engine-neutral target declarations and lifecycle states

pub mod hook;
mod types;

pub use hook::{BuildHook, DeclaredHook, Hook, HookError, HookKind};
pub use types::*;

use std::sync::{Mutex, RwLock};

use tracing::trace;

use crate::label::Label;
use crate::util::sync::{lock, read, write};

/// Progress through the target lifecycle.
#[derive(Debug, Default)]
struct Lifecycle {
  state: TargetState,
  pre_build_ran: bool,
  built: bool,
  post_build_ran: bool,
}

/// A single node in the build graph.
#[derive(Debug)]
pub struct BuildTarget {
  label: Label,
  cmd: Option<String>,
  deps: RwLock<Vec<Label>>,
  outs: RwLock<Vec<String>>,
  pre_build: Option<Hook>,
  post_build: Option<Hook>,
  lifecycle: Mutex<Lifecycle>,
  output: Mutex<Option<String>>,
}

impl BuildTarget {
  pub(crate) fn new(label: Label, spec: TargetSpec, deps: Vec<Label>) -> Self {
    Self {
      label,
      cmd: spec.cmd,
      deps: RwLock::new(deps),
      outs: RwLock::new(spec.outs),
      pre_build: spec.pre_build,
      post_build: spec.post_build,
      lifecycle: Mutex::new(Lifecycle::default()),
      output: Mutex::new(None),
    }
  }

  pub fn label(&self) -> &Label {
    &self.label
  }

  pub fn cmd(&self) -> Option<&str> {
    self.cmd.as_deref()
  }

  /// Snapshot of the declared dependencies in declaration order.
  pub fn deps(&self) -> Vec<Label> {
    read(&self.deps).clone()
  }

  pub fn has_dep(&self, dep: &Label) -> bool {
    read(&self.deps).contains(dep)
  }

  /// Snapshot of the declared output files.
  pub fn outs(&self) -> Vec<String> {
    read(&self.outs).clone()
  }

  pub fn pre_build(&self) -> Option<&Hook> {
    self.pre_build.as_ref()
  }

  pub fn post_build(&self) -> Option<&Hook> {
    self.post_build.as_ref()
  }

  pub fn state(&self) -> TargetState {
    lock(&self.lifecycle).state
  }

  pub fn is_done(&self) -> bool {
    self.state() == TargetState::Done
  }

  pub fn is_failed(&self) -> bool {
    self.state() == TargetState::Failed
  }

  /// Move to `next`, returning the previous state.
  pub fn transition(&self, next: TargetState) -> Result<TargetState, StateError> {
    let mut lifecycle = lock(&self.lifecycle);
    let prev = lifecycle.state;
    if prev == next {
      return Ok(prev);
    }
    if !prev.can_transition_to(next) {
      return Err(StateError {
        label: self.label.clone(),
        from: prev,
        to: next,
      });
    }
    lifecycle.state = next;
    trace!(target_label = %self.label, from = ?prev, to = ?next, "target state changed");
    Ok(prev)
  }

  /// Mark the target failed. Returns false if it had already finished.
  pub fn fail(&self) -> bool {
    self.transition(TargetState::Failed).is_ok()
  }

  /// Whether the pre-build hook still has to run before the action.
  pub fn needs_pre_build(&self) -> bool {
    self.pre_build.is_some() && !lock(&self.lifecycle).pre_build_ran
  }

  /// Whether the build action has already produced output.
  pub fn is_built(&self) -> bool {
    lock(&self.lifecycle).built
  }

  /// Whether the post-build hook still has to run after the action.
  pub fn needs_post_build(&self) -> bool {
    self.post_build.is_some() && !lock(&self.lifecycle).post_build_ran
  }

  /// A post-build hook that has not finished yet and may still add targets
  /// to the package.
  pub fn post_build_pending(&self) -> bool {
    if self.post_build.is_none() {
      return false;
    }
    let lifecycle = lock(&self.lifecycle);
    !lifecycle.post_build_ran && lifecycle.state != TargetState::Failed
  }

  pub(crate) fn mark_hook_ran(&self, kind: HookKind) {
    let mut lifecycle = lock(&self.lifecycle);
    match kind {
      HookKind::PreBuild => lifecycle.pre_build_ran = true,
      HookKind::PostBuild => lifecycle.post_build_ran = true,
    }
  }

  /// Record the captured output of the build action.
  pub fn set_output(&self, output: String) {
    *lock(&self.output) = Some(output);
    lock(&self.lifecycle).built = true;
  }

  pub fn output(&self) -> Option<String> {
    lock(&self.output).clone()
  }

  /// Append a dependency. Returns false if it was already declared.
  ///
  /// Once the target has started, only its own running hook (`from_own_hook`)
  /// may add dependencies; otherwise the current state is returned. The check
  /// and the append happen under the lifecycle lock, so a target that starts
  /// concurrently either sees the new dependency or rejects it.
  pub(crate) fn add_dep(&self, dep: Label, from_own_hook: bool) -> Result<bool, TargetState> {
    let lifecycle = lock(&self.lifecycle);
    if !from_own_hook && lifecycle.state.has_started() {
      return Err(lifecycle.state);
    }
    let mut deps = write(&self.deps);
    if deps.contains(&dep) {
      return Ok(false);
    }
    deps.push(dep);
    Ok(true)
  }

  /// Drop a dependency added by a batch that was then rejected.
  pub(crate) fn remove_dep(&self, dep: &Label) {
    write(&self.deps).retain(|d| d != dep);
  }

  /// Append an output file. Returns false if it was already declared.
  pub(crate) fn add_out(&self, out: &str) -> bool {
    let mut outs = write(&self.outs);
    if outs.iter().any(|o| o == out) {
      return false;
    }
    outs.push(out.to_string());
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn target(name: &str) -> BuildTarget {
    let label = Label::new("pkg", name).unwrap();
    BuildTarget::new(label, TargetSpec::new(name), Vec::new())
  }

  mod lifecycle {
    use super::*;

    #[test]
    fn happy_path() {
      let t = target("a");
      assert_eq!(t.state(), TargetState::Declared);
      t.transition(TargetState::ParsingDeps).unwrap();
      t.transition(TargetState::PreBuild).unwrap();
      t.transition(TargetState::Building).unwrap();
      t.transition(TargetState::PostBuild).unwrap();
      t.transition(TargetState::Done).unwrap();
      assert!(t.is_done());
    }

    #[test]
    fn cannot_skip_to_post_build() {
      let t = target("a");
      let err = t.transition(TargetState::PostBuild).unwrap_err();
      assert_eq!(err.from, TargetState::Declared);
      assert_eq!(err.to, TargetState::PostBuild);
    }

    #[test]
    fn failed_reachable_from_non_terminal() {
      let t = target("a");
      t.transition(TargetState::ParsingDeps).unwrap();
      t.transition(TargetState::Building).unwrap();
      assert!(t.fail());
      assert!(t.is_failed());
    }

    #[test]
    fn done_is_terminal() {
      let t = target("a");
      t.transition(TargetState::ParsingDeps).unwrap();
      t.transition(TargetState::Building).unwrap();
      t.transition(TargetState::Done).unwrap();
      assert!(!t.fail());
      assert!(t.is_done());
    }

    #[test]
    fn failed_target_cannot_start_waiting() {
      let t = target("a");
      assert!(t.fail());
      let err = t.transition(TargetState::ParsingDeps).unwrap_err();
      assert_eq!(err.from, TargetState::Failed);
      assert_eq!(t.state(), TargetState::Failed);
    }

    #[test]
    fn building_can_return_to_waiting() {
      let t = target("a");
      t.transition(TargetState::ParsingDeps).unwrap();
      t.transition(TargetState::Building).unwrap();
      t.transition(TargetState::ParsingDeps).unwrap();
      assert_eq!(t.state(), TargetState::ParsingDeps);
    }

    #[test]
    fn requeue_after_hook() {
      let t = target("a");
      t.transition(TargetState::ParsingDeps).unwrap();
      t.transition(TargetState::PreBuild).unwrap();
      t.transition(TargetState::ParsingDeps).unwrap();
      t.transition(TargetState::Building).unwrap();
      assert_eq!(t.state(), TargetState::Building);
    }
  }

  #[test]
  fn deps_are_deduplicated() {
    let t = target("a");
    let dep = Label::new("pkg", "b").unwrap();
    assert_eq!(t.add_dep(dep.clone(), false), Ok(true));
    assert_eq!(t.add_dep(dep.clone(), false), Ok(false));
    assert_eq!(t.deps(), vec![dep]);
  }

  #[test]
  fn started_target_only_takes_deps_from_own_hook() {
    let t = target("a");
    let dep = Label::new("pkg", "b").unwrap();
    t.transition(TargetState::ParsingDeps).unwrap();
    t.transition(TargetState::Building).unwrap();

    assert_eq!(t.add_dep(dep.clone(), false), Err(TargetState::Building));
    assert!(t.deps().is_empty());

    t.transition(TargetState::PostBuild).unwrap();
    assert_eq!(t.add_dep(dep.clone(), true), Ok(true));
    assert_eq!(t.deps(), vec![dep]);
  }

  #[test]
  fn outs_are_deduplicated() {
    let t = target("a");
    assert!(t.add_out("a.h"));
    assert!(!t.add_out("a.h"));
    assert_eq!(t.outs(), vec!["a.h".to_string()]);
  }

  #[test]
  fn output_marks_built() {
    let t = target("a");
    assert!(!t.is_built());
    t.set_output("hello".to_string());
    assert!(t.is_built());
    assert_eq!(t.output().as_deref(), Some("hello"));
  }
}
