//! Process-wide build state.
//!
//! [`BuildState`] is created once per build, before any package is parsed.
//! It owns the parser engine chosen from configuration (fixed for the whole
//! run), the build graph, the deferred parse registry, the result log, and
//! the queue through which core operations hand follow-up work to the
//! scheduler.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Engine};
use crate::deferred::DeferredParses;
use crate::graph::BuildGraph;
use crate::label::Label;
use crate::parse::{ParseError, Parser, init_parser};
use crate::util::sync::lock;

/// Phase reported with each build event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BuildStatus {
  PackageParsing,
  PackageParsed,
  ParseDeferred,
  ParseResumed,
  ParseFailed,
  TargetBuilding,
  TargetBuilt,
  TargetBuildFailed,
  TargetSkipped,
}

impl BuildStatus {
  pub fn is_failure(self) -> bool {
    matches!(self, BuildStatus::ParseFailed | BuildStatus::TargetBuildFailed)
  }
}

impl fmt::Display for BuildStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BuildStatus::PackageParsing => "parsing",
      BuildStatus::PackageParsed => "parsed",
      BuildStatus::ParseDeferred => "deferred",
      BuildStatus::ParseResumed => "resumed",
      BuildStatus::ParseFailed => "parse-failed",
      BuildStatus::TargetBuilding => "building",
      BuildStatus::TargetBuilt => "built",
      BuildStatus::TargetBuildFailed => "failed",
      BuildStatus::TargetSkipped => "skipped",
    };
    f.write_str(s)
  }
}

/// One entry of the result log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildEvent {
  pub thread: usize,
  pub label: Label,
  pub status: BuildStatus,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// Follow-up work produced by core operations for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingTask {
  /// Parse a package that has just been referenced for the first time.
  Parse { package: String },
  /// Resolve a deferred package again now that `unblocked_by` has run its
  /// post-build hook.
  ResumeParse { package: String, unblocked_by: Label },
  /// Build `label` because `requested_by` needs it.
  Activate { label: Label, requested_by: Label },
}

pub struct BuildState {
  root: PathBuf,
  config: Config,
  parser: Box<dyn Parser>,
  graph: BuildGraph,
  deferred: DeferredParses,
  events: Mutex<Vec<BuildEvent>>,
  tasks: Mutex<VecDeque<PendingTask>>,
}

impl fmt::Debug for BuildState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildState")
      .field("root", &self.root)
      .field("engine", &self.parser.engine())
      .field("deferred", &self.deferred.len())
      .finish_non_exhaustive()
  }
}

impl BuildState {
  /// Initialise the configured parser engine and an empty graph.
  ///
  /// This is the only place an engine is selected; an unknown engine or a
  /// missing preload is a fatal [`ParseError`].
  pub fn new(root: impl Into<PathBuf>, config: Config) -> Result<Self, ParseError> {
    let root = root.into();
    let parser = init_parser(&root, &config)?;
    Ok(Self::with_parser(root, config, parser))
  }

  /// Build state around an already initialised engine.
  pub fn with_parser(root: impl Into<PathBuf>, config: Config, parser: Box<dyn Parser>) -> Self {
    let root = root.into();
    Self {
      graph: BuildGraph::new(root.clone()),
      root,
      config,
      parser,
      deferred: DeferredParses::new(),
      events: Mutex::new(Vec::new()),
      tasks: Mutex::new(VecDeque::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn parser(&self) -> &dyn Parser {
    self.parser.as_ref()
  }

  pub fn engine(&self) -> Engine {
    self.parser.engine()
  }

  pub fn graph(&self) -> &BuildGraph {
    &self.graph
  }

  pub fn deferred(&self) -> &DeferredParses {
    &self.deferred
  }

  /// Locate the build file of `package`, trying each configured name.
  pub fn find_build_file(&self, package: &str) -> Option<PathBuf> {
    let dir = self.root.join(package);
    self
      .config
      .build_file_names(self.engine())
      .into_iter()
      .map(|name| dir.join(name))
      .find(|path| path.is_file())
  }

  /// Report progress for `label`.
  pub fn log_build_result(&self, tid: usize, label: &Label, status: BuildStatus, message: impl Into<String>) {
    let message = message.into();
    match status {
      BuildStatus::TargetSkipped | BuildStatus::ParseDeferred => {
        info!(thread = tid, label = %label, %status, "{message}")
      }
      _ => debug!(thread = tid, label = %label, %status, "{message}"),
    }
    lock(&self.events).push(BuildEvent {
      thread: tid,
      label: label.clone(),
      status,
      message,
      error: None,
    });
  }

  /// Report a failure attributable to `label`.
  pub fn log_build_error(
    &self,
    tid: usize,
    label: &Label,
    status: BuildStatus,
    err: &dyn std::error::Error,
    message: impl Into<String>,
  ) {
    let message = message.into();
    let error = err.to_string();
    if status.is_failure() {
      error!(thread = tid, label = %label, %status, error = %error, "{message}");
    } else {
      warn!(thread = tid, label = %label, %status, error = %error, "{message}");
    }
    lock(&self.events).push(BuildEvent {
      thread: tid,
      label: label.clone(),
      status,
      message,
      error: Some(error),
    });
  }

  /// Snapshot of every event reported so far.
  pub fn events(&self) -> Vec<BuildEvent> {
    lock(&self.events).clone()
  }

  /// Events reported for `label`, oldest first.
  pub fn events_for(&self, label: &Label) -> Vec<BuildEvent> {
    lock(&self.events).iter().filter(|e| &e.label == label).cloned().collect()
  }

  pub fn enqueue(&self, task: PendingTask) {
    lock(&self.tasks).push_back(task);
  }

  /// Take every queued task, oldest first.
  pub fn drain_tasks(&self) -> Vec<PendingTask> {
    lock(&self.tasks).drain(..).collect()
  }

  /// Make sure `package` gets parsed, queueing the parse if nobody asked
  /// for it before.
  pub fn request_parse(&self, package: &str) -> bool {
    let created = self.graph.request_parse(package);
    if created {
      self.enqueue(PendingTask::Parse {
        package: package.to_string(),
      });
    }
    created
  }
}
