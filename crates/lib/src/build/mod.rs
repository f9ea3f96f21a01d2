//! Build scheduling.
//!
//! [`build`] drives a [`BuildState`] to completion on the tokio runtime:
//!
//! - requested labels and, transitively, their dependencies are activated
//! - packages are parsed on the blocking pool the first time they are seen
//! - a target runs once every dependency is `Done`: pre-build hook, action,
//!   post-build hook, then any package deferred on it is resumed
//! - a hook that adds unbuilt dependencies sends its target back to wait
//! - dependents of failed targets are skipped
//!
//! Parses and targets share one semaphore of `build.parallelism` permits.
//! Hooks and parses are synchronous and run through `spawn_blocking`.
//!
//! # Submodules
//!
//! - [`action`] - Action runners
//! - `types` - Errors and the build summary

pub mod action;
mod types;

pub use action::{ActionError, ActionRunner, ShellRunner};
pub use types::{BuildError, BuildSummary, Stalled};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::graph::GraphError;
use crate::label::{Label, PACKAGE_PSEUDO_TARGET};
use crate::package::{PackageError, PackageState};
use crate::parse::{ParseError, parse_package, resume_parse};
use crate::state::{BuildState, BuildStatus, PendingTask};
use crate::target::{BuildTarget, TargetState};

use types::TargetOutcome;

/// Thread id the scheduler itself reports under.
const SCHEDULER_TID: usize = 0;

/// Build `labels` and everything they depend on.
///
/// `//pkg:all` requests every target of `pkg`. Failures of individual
/// targets are collected in the returned summary; a fatal error stops new
/// work, waits for in-flight tasks and is returned instead.
pub async fn build<R: ActionRunner>(
  state: Arc<BuildState>,
  runner: Arc<R>,
  labels: &[Label],
) -> Result<BuildSummary, BuildError> {
  info!(
    requested = labels.len(),
    parallelism = state.config().build.parallelism,
    engine = %state.engine(),
    "starting build"
  );

  let mut scheduler = Scheduler::new(state, runner);
  for label in labels {
    scheduler.activate(label.clone(), label.clone());
  }
  scheduler.run().await
}

enum TaskDone {
  Parse {
    package: String,
    result: Result<(), BuildError>,
  },
  Target {
    label: Label,
    result: Result<TargetOutcome, BuildError>,
  },
}

struct Scheduler<R> {
  state: Arc<BuildState>,
  runner: Arc<R>,
  semaphore: Arc<Semaphore>,
  cancelled: Arc<AtomicBool>,
  join_set: JoinSet<TaskDone>,
  next_tid: usize,
  /// Every activated label and the label that asked for it.
  requested_by: BTreeMap<Label, Label>,
  /// Activated labels that are neither running nor finished.
  waiting: BTreeSet<Label>,
  running: HashSet<Label>,
  summary: BuildSummary,
  stopping: bool,
  fatal: Option<BuildError>,
}

impl<R: ActionRunner> Scheduler<R> {
  fn new(state: Arc<BuildState>, runner: Arc<R>) -> Self {
    let permits = state.config().build.parallelism.max(1);
    Self {
      state,
      runner,
      semaphore: Arc::new(Semaphore::new(permits)),
      cancelled: Arc::new(AtomicBool::new(false)),
      join_set: JoinSet::new(),
      next_tid: SCHEDULER_TID,
      requested_by: BTreeMap::new(),
      waiting: BTreeSet::new(),
      running: HashSet::new(),
      summary: BuildSummary::default(),
      stopping: false,
      fatal: None,
    }
  }

  async fn run(mut self) -> Result<BuildSummary, BuildError> {
    loop {
      self.settle();

      let Some(joined) = self.join_set.join_next().await else {
        break;
      };
      match joined {
        Ok(done) => self.complete(done),
        Err(e) => error!(error = %e, "build task panicked"),
      }
    }
    self.finish()
  }

  fn tid(&mut self) -> usize {
    self.next_tid += 1;
    self.next_tid
  }

  /// Returns true if `label` was not active before.
  fn activate(&mut self, label: Label, requested_by: Label) -> bool {
    if self.requested_by.contains_key(&label) {
      return false;
    }
    debug!(label = %label, requested_by = %requested_by, "activating");
    self.state.request_parse(label.package());
    self.requested_by.insert(label.clone(), requested_by);
    self.waiting.insert(label);
    true
  }

  /// Hand out queued work until nothing changes any more.
  fn settle(&mut self) {
    loop {
      let drained = self.drain_state_tasks();
      let scheduled = self.schedule();
      if !drained && !scheduled {
        break;
      }
    }
  }

  fn drain_state_tasks(&mut self) -> bool {
    let tasks = self.state.drain_tasks();
    if self.stopping {
      if !tasks.is_empty() {
        debug!(dropped = tasks.len(), "build stopping, dropping queued work");
      }
      return false;
    }

    let mut changed = !tasks.is_empty();
    for task in tasks {
      match task {
        PendingTask::Parse { package } => self.spawn_parse(package, None),
        PendingTask::ResumeParse { package, unblocked_by } => self.spawn_parse(package, Some(unblocked_by)),
        PendingTask::Activate { label, requested_by } => {
          self.activate(label, requested_by);
        }
      }
    }

    // A deferred package only resumes once the hook it waits on has run, so
    // that hook's target has to be built.
    for (blocking, package) in self.state.deferred().entries() {
      changed |= self.activate(blocking, Label::for_package(&package));
    }
    changed
  }

  /// Start every waiting target that has become ready. Returns true if the
  /// waiting set or the set of active labels changed.
  fn schedule(&mut self) -> bool {
    if self.stopping {
      return false;
    }

    let state = Arc::clone(&self.state);
    let graph = state.graph();
    let mut changed = false;
    let candidates: Vec<Label> = self.waiting.iter().cloned().collect();

    for label in candidates {
      let Some(pkg) = graph.package(label.package()) else {
        continue;
      };
      match pkg.state() {
        PackageState::Empty | PackageState::Parsing => continue,
        PackageState::Failed => {
          self.waiting.remove(&label);
          state.log_build_result(
            SCHEDULER_TID,
            &label,
            BuildStatus::TargetSkipped,
            format!("Skipping {label}: package //{} failed to parse", pkg.path()),
          );
          self.summary.skipped.push(label);
          changed = true;
          continue;
        }
        PackageState::Parsed | PackageState::Resolved => {}
      }

      let Some(target) = pkg.target(label.name()) else {
        changed |= self.resolve_missing(&label, &pkg);
        continue;
      };

      match target.state() {
        TargetState::Done => {
          self.waiting.remove(&label);
          changed = true;
          continue;
        }
        TargetState::Failed => {
          // Failed outside a target task, e.g. while resolving its package.
          self.waiting.remove(&label);
          self.summary.failed.push(label);
          changed = true;
          continue;
        }
        TargetState::Declared => {
          if let Err(err) = target.transition(TargetState::ParsingDeps) {
            // Failed while its package was being resolved; picked up as
            // `Failed` on the next pass.
            debug!(error = %err, "target left Declared concurrently");
            changed = true;
            continue;
          }
        }
        TargetState::ParsingDeps => {}
        TargetState::PreBuild | TargetState::Building | TargetState::PostBuild => continue,
      }

      if let Some(dep) = graph.failed_dep(&target) {
        self.waiting.remove(&label);
        self.skip(&target, &dep);
        changed = true;
        continue;
      }

      if let Some(err) = missing_dep(&state, &target) {
        self.waiting.remove(&label);
        if target.fail() {
          state.log_build_error(
            SCHEDULER_TID,
            &label,
            BuildStatus::TargetBuildFailed,
            &err,
            format!("Failed to resolve dependencies of {label}"),
          );
        }
        if target.post_build().is_some() {
          state.parser().undefer_any_parses(&state, &target);
        }
        self.summary.failed.push(label);
        changed = true;
        continue;
      }

      for dep in target.deps() {
        changed |= self.activate(dep, label.clone());
      }

      if graph.unbuilt_deps(&target).is_empty() {
        self.waiting.remove(&label);
        self.spawn_target(target);
        changed = true;
      }
    }
    changed
  }

  /// `label` names no target of its parsed package.
  fn resolve_missing(&mut self, label: &Label, pkg: &crate::package::Package) -> bool {
    if label.name() == PACKAGE_PSEUDO_TARGET {
      self.waiting.remove(label);
      for target in pkg.targets() {
        self.activate(target.label().clone(), label.clone());
      }
      return true;
    }

    // A pending post-build hook may still add it.
    let pending = pkg.pending_post_build_hooks();
    if !pending.is_empty() {
      let mut changed = false;
      for blocking in pending {
        changed |= self.activate(blocking, label.clone());
      }
      return changed;
    }
    if pkg.target(label.name()).is_some() {
      // Added by a hook that finished after the first lookup.
      return true;
    }

    self.waiting.remove(label);
    let requested_by = self.requested_by.get(label).cloned().unwrap_or_else(|| label.clone());
    if &requested_by != label {
      // Reported against the dependent, see `missing_dep`.
      debug!(label = %label, requested_by = %requested_by, "dependency does not exist");
      return true;
    }

    let err = PackageError::UnknownTarget {
      package: label.package().to_string(),
      name: label.name().to_string(),
    };
    self.state.log_build_error(
      SCHEDULER_TID,
      label,
      BuildStatus::TargetBuildFailed,
      &err,
      format!("No such target {label}"),
    );
    self.summary.failed.push(label.clone());
    true
  }

  fn skip(&mut self, target: &BuildTarget, dep: &Label) {
    let label = target.label();
    if target.fail() {
      self.state.log_build_result(
        SCHEDULER_TID,
        label,
        BuildStatus::TargetSkipped,
        format!("Skipping {label}: dependency {dep} failed"),
      );
    }
    if target.post_build().is_some() {
      self.state.parser().undefer_any_parses(&self.state, target);
    }
    self.summary.skipped.push(label.clone());
  }

  fn spawn_parse(&mut self, package: String, resume: Option<Label>) {
    let tid = self.tid();
    let state = Arc::clone(&self.state);
    let semaphore = Arc::clone(&self.semaphore);
    let cancelled = Arc::clone(&self.cancelled);

    self.join_set.spawn(async move {
      let result = run_parse(tid, state, semaphore, cancelled, package.clone(), resume).await;
      TaskDone::Parse { package, result }
    });
  }

  fn spawn_target(&mut self, target: Arc<BuildTarget>) {
    let tid = self.tid();
    let label = target.label().clone();
    let state = Arc::clone(&self.state);
    let runner = Arc::clone(&self.runner);
    let semaphore = Arc::clone(&self.semaphore);
    let cancelled = Arc::clone(&self.cancelled);

    debug!(label = %label, thread = tid, "scheduling target");
    self.running.insert(label.clone());
    self.join_set.spawn(async move {
      let result = run_target(tid, state, runner, semaphore, cancelled, target).await;
      TaskDone::Target { label, result }
    });
  }

  fn complete(&mut self, done: TaskDone) {
    match done {
      TaskDone::Parse { package, result } => {
        if let Err(err) = result {
          debug!(package = %package, error = %err, "parse task failed");
          if err.is_fatal() {
            self.abort(err);
          } else if self.state.config().build.fail_fast {
            self.stop();
          }
        }
      }
      TaskDone::Target { label, result } => {
        self.running.remove(&label);
        match result {
          Ok(TargetOutcome::Built) => self.summary.built.push(label),
          Ok(TargetOutcome::Requeued) => {
            debug!(label = %label, "waiting for dependencies added by a hook");
            self.waiting.insert(label);
          }
          Ok(TargetOutcome::Cancelled) => {
            self.waiting.insert(label);
          }
          Err(err) => {
            self.fail(&label, &err);
            if err.is_fatal() {
              self.abort(err);
            } else if self.state.config().build.fail_fast {
              self.stop();
            }
          }
        }
      }
    }
  }

  fn fail(&mut self, label: &Label, err: &BuildError) {
    if let Some(target) = self.state.graph().target(label) {
      if target.fail() {
        self.state.log_build_error(
          SCHEDULER_TID,
          label,
          BuildStatus::TargetBuildFailed,
          err,
          format!("Failed to build {label}"),
        );
      }
      if target.post_build().is_some() {
        self.state.parser().undefer_any_parses(&self.state, &target);
      }
    }
    self.summary.failed.push(label.clone());
  }

  /// Start no new work; tasks already running finish normally.
  fn stop(&mut self) {
    if !self.stopping {
      warn!(in_flight = self.join_set.len(), "stopping build after failure");
    }
    self.stopping = true;
    self.cancelled.store(true, Ordering::SeqCst);
  }

  fn abort(&mut self, err: BuildError) {
    error!(error = %err, "fatal error, aborting build");
    self.stop();
    if self.fatal.is_none() {
      self.fatal = Some(err);
    }
  }

  fn finish(mut self) -> Result<BuildSummary, BuildError> {
    if let Some(err) = self.fatal.take() {
      return Err(err);
    }

    let waiting = std::mem::take(&mut self.waiting);
    for label in waiting {
      let reason = self.stall_reason(&label);
      self.state.log_build_result(
        SCHEDULER_TID,
        &label,
        BuildStatus::TargetSkipped,
        format!("{label} stalled: {reason}"),
      );
      self.summary.stalled.push(Stalled { label, reason });
    }

    info!(
      built = self.summary.built.len(),
      failed = self.summary.failed.len(),
      skipped = self.summary.skipped.len(),
      stalled = self.summary.stalled.len(),
      "build complete"
    );
    Ok(self.summary)
  }

  fn stall_reason(&self, label: &Label) -> String {
    if self.stopping {
      return "not started because the build stopped after a failure".to_string();
    }

    let graph = self.state.graph();
    let package = label.package();
    let Some(pkg) = graph.package(package) else {
      return format!("package //{package} was never parsed");
    };
    if matches!(pkg.state(), PackageState::Empty | PackageState::Parsing) {
      return format!("package //{package} was never parsed");
    }

    let blockers: Vec<String> = self
      .state
      .deferred()
      .entries()
      .into_iter()
      .filter(|(_, p)| p == package)
      .map(|(blocking, _)| blocking.to_string())
      .collect();
    if !blockers.is_empty() {
      return format!(
        "//{package} is deferred until the post-build function of {} has run",
        blockers.join(", ")
      );
    }

    match pkg.target(label.name()) {
      Some(target) => {
        let unbuilt: Vec<String> = graph.unbuilt_deps(&target).iter().map(ToString::to_string).collect();
        if unbuilt.is_empty() {
          "never became ready".to_string()
        } else {
          format!("waiting for {}", unbuilt.join(", "))
        }
      }
      None => {
        let pending: Vec<String> = pkg.pending_post_build_hooks().iter().map(ToString::to_string).collect();
        format!(
          "target does not exist; post-build functions that may add it have not run: {}",
          pending.join(", ")
        )
      }
    }
  }
}

/// A dependency of `target` that is gone for good: its package is parsed,
/// it does not exist, and no pending post-build hook can add it any more.
fn missing_dep(state: &BuildState, target: &BuildTarget) -> Option<GraphError> {
  let graph = state.graph();
  target.deps().into_iter().find_map(|dep| {
    let pkg = graph.package(dep.package())?;
    if !matches!(pkg.state(), PackageState::Parsed | PackageState::Resolved) {
      return None;
    }
    // Same order as dependency resolution: hooks first, then the target.
    let pending = pkg.pending_post_build_hooks();
    if pkg.target(dep.name()).is_some() || !pending.is_empty() {
      return None;
    }
    Some(GraphError::MissingTarget {
      label: dep,
      referenced_by: target.label().clone(),
    })
  })
}

async fn run_parse(
  tid: usize,
  state: Arc<BuildState>,
  semaphore: Arc<Semaphore>,
  cancelled: Arc<AtomicBool>,
  package: String,
  resume: Option<Label>,
) -> Result<(), BuildError> {
  let _permit = semaphore.acquire_owned().await?;
  if cancelled.load(Ordering::SeqCst) {
    return Ok(());
  }

  let label = Label::for_package(&package);
  blocking(&label, move || {
    let (pkg, _) = state.graph().get_or_create_package(&package);
    match resume {
      None => parse_package(tid, &state, &pkg),
      Some(unblocked_by) => resume_parse(tid, &state, &pkg, &unblocked_by),
    }
  })
  .await
}

/// Take one target as far as it can go: pre-build hook, action, post-build
/// hook, done. Stops early if a hook added dependencies that are not built.
async fn run_target<R: ActionRunner>(
  tid: usize,
  state: Arc<BuildState>,
  runner: Arc<R>,
  semaphore: Arc<Semaphore>,
  cancelled: Arc<AtomicBool>,
  target: Arc<BuildTarget>,
) -> Result<TargetOutcome, BuildError> {
  let _permit = semaphore.acquire_owned().await?;
  if cancelled.load(Ordering::SeqCst) {
    return Ok(TargetOutcome::Cancelled);
  }
  let label = target.label().clone();

  if target.needs_pre_build() {
    target.transition(TargetState::PreBuild)?;
    if gained_unbuilt_deps(&state, &target)? {
      return Ok(TargetOutcome::Requeued);
    }
    let (s, t) = (Arc::clone(&state), Arc::clone(&target));
    blocking(&label, move || s.parser().run_pre_build_function(tid, &s, &t)).await?;

    if !state.graph().unbuilt_deps(&target).is_empty() {
      target.transition(TargetState::ParsingDeps)?;
      return Ok(TargetOutcome::Requeued);
    }
  }

  let prev = target.transition(TargetState::Building)?;
  if prev == TargetState::ParsingDeps && gained_unbuilt_deps(&state, &target)? {
    return Ok(TargetOutcome::Requeued);
  }
  let output = match target.output() {
    // Built on an earlier attempt, before a hook added dependencies.
    Some(output) => output,
    None => {
      state.log_build_result(tid, &label, BuildStatus::TargetBuilding, format!("Building {label}"));
      let dir = state.root().join(label.package());
      let output = runner
        .run(&dir, &target)
        .await
        .map_err(|source| BuildError::Action {
          label: label.clone(),
          source,
        })?;
      target.set_output(output.clone());
      output
    }
  };

  if target.needs_post_build() {
    target.transition(TargetState::PostBuild)?;
    let (s, t) = (Arc::clone(&state), Arc::clone(&target));
    blocking(&label, move || s.parser().run_post_build_function(tid, &s, &t, &output)).await?;
    state.parser().undefer_any_parses(&state, &target);

    if !state.graph().unbuilt_deps(&target).is_empty() {
      target.transition(TargetState::ParsingDeps)?;
      return Ok(TargetOutcome::Requeued);
    }
  }

  target.transition(TargetState::Done)?;
  state.log_build_result(tid, &label, BuildStatus::TargetBuilt, format!("Built {label}"));
  Ok(TargetOutcome::Built)
}

/// Called right after `target` leaves `ParsingDeps`. A sibling's hook may
/// have added a dependency between the readiness check and the transition;
/// from the transition on, such edits are rejected instead. Sends the target
/// back to wait if anything it depends on is not built.
fn gained_unbuilt_deps(state: &BuildState, target: &BuildTarget) -> Result<bool, BuildError> {
  let unbuilt = state.graph().unbuilt_deps(target);
  if unbuilt.is_empty() {
    return Ok(false);
  }
  debug!(label = %target.label(), unbuilt = unbuilt.len(), "dependencies added before start");
  target.transition(TargetState::ParsingDeps)?;
  Ok(true)
}

async fn blocking<F>(label: &Label, f: F) -> Result<(), BuildError>
where
  F: FnOnce() -> Result<(), ParseError> + Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|source| BuildError::Join {
      label: label.clone(),
      source,
    })??;
  Ok(())
}
