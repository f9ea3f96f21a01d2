//! Parses waiting on another target's post-build hook.
//!
//! When a package depends on a target that does not exist yet, but some
//! target of the owning package still has a post-build hook to run, that
//! hook may yet create it. Resolution of the depending package is parked here,
//! keyed by the hook's target, and resumed once the hook has finished.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use crate::label::Label;
use crate::util::sync::lock;

/// Result of asking to park a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
  /// Parked until the blocking hook finishes.
  Deferred,
  /// The blocking hook has already finished; resolve again now.
  Proceed,
}

#[derive(Debug, Default)]
struct Inner {
  blocked: HashMap<Label, Vec<String>>,
  released: HashSet<Label>,
}

/// Registry of deferred package resolutions, keyed by blocking target.
#[derive(Debug, Default)]
pub struct DeferredParses {
  inner: Mutex<Inner>,
}

impl DeferredParses {
  pub fn new() -> Self {
    Self::default()
  }

  /// Park `package` until the post-build hook of `blocking` has run.
  ///
  /// Registering the same package twice under one label keeps a single
  /// entry. If the hook finished before this call, nothing is parked and
  /// [`Deferral::Proceed`] tells the caller to retry immediately.
  pub fn defer(&self, package: &str, blocking: &Label) -> Deferral {
    let mut inner = lock(&self.inner);
    if inner.released.contains(blocking) {
      return Deferral::Proceed;
    }

    let waiting = inner.blocked.entry(blocking.clone()).or_default();
    if !waiting.iter().any(|p| p == package) {
      waiting.push(package.to_string());
      debug!(package, blocking = %blocking, "deferred package resolution");
    }
    Deferral::Deferred
  }

  /// Record that the hook of `label` has finished and take every package
  /// that was waiting on it. Entries keyed by other labels are untouched.
  pub fn undefer(&self, label: &Label) -> Vec<String> {
    let mut inner = lock(&self.inner);
    inner.released.insert(label.clone());
    inner.blocked.remove(label).unwrap_or_default()
  }

  /// Packages currently waiting on `label`.
  pub fn blocked_on(&self, label: &Label) -> Vec<String> {
    lock(&self.inner).blocked.get(label).cloned().unwrap_or_default()
  }

  /// Whether `package` is waiting on any hook.
  pub fn is_blocked(&self, package: &str) -> bool {
    lock(&self.inner).blocked.values().any(|w| w.iter().any(|p| p == package))
  }

  /// Number of parked entries.
  pub fn len(&self) -> usize {
    lock(&self.inner).blocked.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Every parked entry as `(blocking label, package)`, for stall reports.
  pub fn entries(&self) -> Vec<(Label, String)> {
    let inner = lock(&self.inner);
    let mut entries: Vec<_> = inner
      .blocked
      .iter()
      .flat_map(|(label, pkgs)| pkgs.iter().map(move |p| (label.clone(), p.clone())))
      .collect();
    entries.sort();
    entries
  }
}
