//! Types for build scheduling.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::action::ActionError;
use crate::label::Label;
use crate::parse::ParseError;
use crate::target::StateError;

/// Errors that stop a target or the whole build.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error("action for {label} failed: {source}")]
  Action {
    label: Label,
    #[source]
    source: ActionError,
  },

  /// A hook or parse running on the blocking pool panicked or was cancelled.
  #[error("task for {label} did not complete: {source}")]
  Join {
    label: Label,
    #[source]
    source: tokio::task::JoinError,
  },

  /// The target was changed underneath the task, usually failed while its
  /// package was being resolved again.
  #[error(transparent)]
  State(#[from] StateError),

  #[error("scheduler semaphore closed")]
  SemaphoreClosed(#[from] tokio::sync::AcquireError),
}

impl BuildError {
  /// Fatal errors abort the whole build once in-flight work drains.
  pub fn is_fatal(&self) -> bool {
    match self {
      BuildError::Parse(e) => e.is_fatal(),
      BuildError::Action { .. } | BuildError::State(_) => false,
      BuildError::Join { .. } | BuildError::SemaphoreClosed(_) => true,
    }
  }
}

/// A target that could never become ready, with the reason why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stalled {
  pub label: Label,
  pub reason: String,
}

impl fmt::Display for Stalled {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.label, self.reason)
  }
}

/// Outcome of a build run that was not aborted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
  /// Targets built by this run, in completion order.
  pub built: Vec<Label>,
  /// Targets that failed to resolve, run a hook, or run their action.
  pub failed: Vec<Label>,
  /// Targets not attempted because a dependency failed.
  pub skipped: Vec<Label>,
  /// Activated targets that never became ready.
  pub stalled: Vec<Stalled>,
}

impl BuildSummary {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty() && self.stalled.is_empty()
  }
}

/// Where a target task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetOutcome {
  Built,
  /// A hook added dependencies that are not built yet.
  Requeued,
  /// The build stopped before the task could start.
  Cancelled,
}
