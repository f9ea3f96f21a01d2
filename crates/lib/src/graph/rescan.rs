//! Dependency rescans.
//!
//! After a package is parsed, after a deferred package is resumed, and after
//! a hook has changed a target's dependencies, every newly visible edge has
//! to be followed: unknown packages get parsed, targets that a pending
//! post-build hook may still create are waited for, and anything that will
//! never exist is reported against the target that asked for it.

use tracing::{debug, trace};

use super::{EdgeKind, GraphError};
use crate::deferred::Deferral;
use crate::label::Label;
use crate::package::{CallbackOutcome, Package, PackageState};
use crate::state::{BuildState, BuildStatus, PendingTask};
use crate::target::BuildTarget;

/// Availability of one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepStatus {
  /// Built and usable now.
  Built,
  /// Exists but is not built yet.
  Pending,
  /// Its package has not been parsed yet.
  Parsing,
  /// It does not exist yet, but a post-build hook of its package may still
  /// add it. The depending package has been deferred.
  Deferred,
}

/// Result of rescanning a target after a hook changed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rescan {
  /// New dependencies that are not built yet.
  pub pending: Vec<Label>,
  /// Number of new edges that were examined.
  pub examined: usize,
}

impl Rescan {
  pub fn is_ready(&self) -> bool {
    self.pending.is_empty()
  }
}

/// Follow every edge and target a committed hook added.
///
/// New targets are handed to the scheduler for activation, unbuilt new
/// dependencies are activated on behalf of their dependent. Cycle checks
/// already happened when the edges were committed. Rescanning the same
/// outcome again queues nothing that has not already been queued and
/// registers no new deferrals.
pub fn rescan_deps(
  tid: usize,
  state: &BuildState,
  target: &BuildTarget,
  outcome: &CallbackOutcome,
) -> Result<Rescan, GraphError> {
  let mut rescan = Rescan::default();

  for label in &outcome.new_targets {
    state.enqueue(PendingTask::Activate {
      label: label.clone(),
      requested_by: target.label().clone(),
    });
  }

  for (dependent, dep) in &outcome.new_edges {
    rescan.examined += 1;
    let status = ensure_available(tid, state, dependent, dep)?;
    trace!(dependent = %dependent, dep = %dep, ?status, "rescanned edge");
    if status != DepStatus::Built {
      rescan.pending.push(dep.clone());
      state.enqueue(PendingTask::Activate {
        label: dep.clone(),
        requested_by: dependent.clone(),
      });
    }
  }

  if !rescan.pending.is_empty() {
    debug!(target_label = %target.label(), pending = rescan.pending.len(), "hook added unbuilt dependencies");
  }
  Ok(rescan)
}

/// Make sure `dep` is, or will become, available to `dependent`.
pub fn ensure_available(tid: usize, state: &BuildState, dependent: &Label, dep: &Label) -> Result<DepStatus, GraphError> {
  let graph = state.graph();
  let (pkg, created) = graph.get_or_create_package(dep.package());
  if created {
    state.enqueue(PendingTask::Parse {
      package: dep.package().to_string(),
    });
    return Ok(DepStatus::Parsing);
  }

  match pkg.state() {
    PackageState::Empty | PackageState::Parsing => return Ok(DepStatus::Parsing),
    PackageState::Failed => {
      return Err(GraphError::PackageFailed {
        label: dep.clone(),
        referenced_by: dependent.clone(),
      });
    }
    PackageState::Parsed | PackageState::Resolved => {}
  }

  // Snapshot pending hooks before looking for the target: a hook that
  // finishes in between has already committed whatever it added.
  let pending = pkg.pending_post_build_hooks();
  if let Some(found) = pkg.target(dep.name()) {
    return Ok(status_of(&found));
  }

  for blocking in &pending {
    if state.deferred().defer(dependent.package(), blocking) == Deferral::Deferred {
      state.log_build_result(
        tid,
        &Label::for_package(dependent.package()),
        BuildStatus::ParseDeferred,
        format!("Deferring //{} until post-build function of {blocking} has run", dependent.package()),
      );
      return Ok(DepStatus::Deferred);
    }
  }

  // Every hook that could have added it has finished.
  match pkg.target(dep.name()) {
    Some(found) => Ok(status_of(&found)),
    None => Err(GraphError::MissingTarget {
      label: dep.clone(),
      referenced_by: dependent.clone(),
    }),
  }
}

fn status_of(target: &BuildTarget) -> DepStatus {
  if target.is_done() {
    DepStatus::Built
  } else {
    DepStatus::Pending
  }
}

/// Link and check the declared dependencies of every target in `pkg`.
///
/// Targets whose dependencies can never be satisfied are failed and reported;
/// this is not an error for the package as a whole. A static cycle is, and is
/// returned. The package becomes `Resolved` once nothing in it is deferred.
/// Safe to call again after a deferral is released.
pub fn resolve_package(tid: usize, state: &BuildState, pkg: &Package) -> Result<bool, GraphError> {
  let mut deferred = false;

  for target in pkg.targets() {
    if target.state().is_terminal() {
      continue;
    }

    if let Err(err) = state.graph().link_target(&target, EdgeKind::Static) {
      if err.is_fatal() {
        state.log_build_error(
          tid,
          target.label(),
          BuildStatus::ParseFailed,
          &err,
          format!("Dependency cycle involving {}", target.label()),
        );
        return Err(err);
      }
      fail_target(tid, state, &target, &err);
      continue;
    }

    for dep in target.deps() {
      match ensure_available(tid, state, target.label(), &dep) {
        Ok(DepStatus::Deferred) => deferred = true,
        Ok(_) => {}
        Err(err) => {
          fail_target(tid, state, &target, &err);
          break;
        }
      }
    }
  }

  if !deferred && pkg.state() == PackageState::Parsed {
    pkg.set_state(PackageState::Resolved);
  }
  Ok(!deferred)
}

fn fail_target(tid: usize, state: &BuildState, target: &BuildTarget, err: &GraphError) {
  if target.fail() {
    state.log_build_error(
      tid,
      target.label(),
      BuildStatus::TargetBuildFailed,
      err,
      format!("Failed to resolve dependencies of {}", target.label()),
    );
  }
}
