//! The build graph: every known package and the dependency edges between
//! their targets.
//!
//! Packages are created on first reference and parsed at most once. Targets
//! are found by label through their package; the edges live in a single
//! [`DependencyDag`] whose lock is the only place cycle detection happens.
//!
//! # Submodules
//!
//! - [`dag`] - Label-keyed DAG with atomic, cycle-checked batch insertion
//! - [`rescan`] - Re-reading a target's dependencies after its graph changed

pub mod dag;
pub mod rescan;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, trace};

use crate::label::Label;
use crate::package::{Package, PackageError, PackageState};
use crate::target::BuildTarget;
use crate::util::sync::{lock, read, write};

pub use dag::DependencyDag;
pub use rescan::{DepStatus, Rescan, rescan_deps, resolve_package};

/// Where an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
  /// Declared in a build file.
  Static,
  /// Added by a hook while the build runs.
  Dynamic,
}

impl fmt::Display for EdgeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EdgeKind::Static => f.write_str("static"),
      EdgeKind::Dynamic => f.write_str("dynamic"),
    }
  }
}

/// Errors raised while linking or resolving targets.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error("{kind} dependency cycle: {}", format_cycle(path))]
  Cycle { path: Vec<Label>, kind: EdgeKind },

  #[error("{referenced_by} depends on {label}, which does not exist")]
  MissingTarget { label: Label, referenced_by: Label },

  #[error("{referenced_by} depends on {label}, but package //{} failed to parse", label.package())]
  PackageFailed { label: Label, referenced_by: Label },

  #[error(transparent)]
  Package(#[from] PackageError),
}

impl GraphError {
  /// A cycle among declared dependencies can never be built around.
  /// Everything else fails only the target that ran into it.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      GraphError::Cycle {
        kind: EdgeKind::Static,
        ..
      }
    )
  }
}

fn format_cycle(path: &[Label]) -> String {
  path.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// All packages and dependency edges known to one build.
#[derive(Debug)]
pub struct BuildGraph {
  root: PathBuf,
  packages: RwLock<HashMap<String, Arc<Package>>>,
  dag: Mutex<DependencyDag>,
}

impl BuildGraph {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      packages: RwLock::new(HashMap::new()),
      dag: Mutex::new(DependencyDag::new()),
    }
  }

  /// Repository root; package paths are relative to it.
  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn package(&self, path: &str) -> Option<Arc<Package>> {
    read(&self.packages).get(path).cloned()
  }

  /// Every known package, sorted by path.
  pub fn packages(&self) -> Vec<Arc<Package>> {
    let mut packages: Vec<_> = read(&self.packages).values().cloned().collect();
    packages.sort_by(|a, b| a.path().cmp(b.path()));
    packages
  }

  /// Look up a package, creating an empty one if it is not known yet.
  /// The flag is true when the package was created by this call.
  pub fn get_or_create_package(&self, path: &str) -> (Arc<Package>, bool) {
    if let Some(pkg) = self.package(path) {
      return (pkg, false);
    }

    let mut packages = write(&self.packages);
    if let Some(pkg) = packages.get(path) {
      return (Arc::clone(pkg), false);
    }
    let pkg = Arc::new(Package::new(path, self.root.join(path)));
    packages.insert(path.to_string(), Arc::clone(&pkg));
    debug!(package = path, "new package");
    (pkg, true)
  }

  /// Make sure `path` will be parsed. Returns true if nobody had asked for
  /// it before, in which case the caller is responsible for scheduling the
  /// parse.
  pub fn request_parse(&self, path: &str) -> bool {
    self.get_or_create_package(path).1
  }

  pub fn target(&self, label: &Label) -> Option<Arc<BuildTarget>> {
    self.package(label.package())?.target(label.name())
  }

  /// Every target of every package, packages sorted by path.
  pub fn targets(&self) -> Vec<Arc<BuildTarget>> {
    self.packages().iter().flat_map(|p| p.targets()).collect()
  }

  /// Check a batch of `(dependent, dependency)` edges for cycles without
  /// inserting them.
  pub fn check_edges(&self, edges: &[(Label, Label)], kind: EdgeKind) -> Result<(), GraphError> {
    if edges.is_empty() {
      return Ok(());
    }
    lock(&self.dag)
      .check(edges)
      .map_err(|path| GraphError::Cycle { path, kind })
  }

  /// Insert a batch of `(dependent, dependency)` edges atomically.
  ///
  /// Edges already present are skipped, so linking the same batch twice is
  /// harmless. Returns how many edges were new.
  pub fn link(&self, edges: &[(Label, Label)], kind: EdgeKind) -> Result<usize, GraphError> {
    if edges.is_empty() {
      return Ok(0);
    }
    let added = lock(&self.dag)
      .insert_edges(edges)
      .map_err(|path| GraphError::Cycle { path, kind })?;
    trace!(added, %kind, "linked edges");
    Ok(added)
  }

  /// Link every declared dependency of `target`.
  pub fn link_target(&self, target: &BuildTarget, kind: EdgeKind) -> Result<usize, GraphError> {
    let edges: Vec<_> = target
      .deps()
      .into_iter()
      .map(|dep| (target.label().clone(), dep))
      .collect();
    self.link(&edges, kind)
  }

  pub fn has_edge(&self, dependent: &Label, dep: &Label) -> bool {
    lock(&self.dag).contains_edge(dependent, dep)
  }

  pub fn edge_count(&self) -> usize {
    lock(&self.dag).edge_count()
  }

  /// Targets that depend directly on `label`.
  pub fn dependents(&self, label: &Label) -> Vec<Label> {
    lock(&self.dag).dependents(label)
  }

  /// All linked labels, dependencies first.
  pub fn build_order(&self) -> Vec<Label> {
    lock(&self.dag).topological_order()
  }

  /// Dependencies of `target` that are not built yet, including ones whose
  /// package or target does not exist yet.
  pub fn unbuilt_deps(&self, target: &BuildTarget) -> Vec<Label> {
    target
      .deps()
      .into_iter()
      .filter(|dep| !self.target(dep).is_some_and(|t| t.is_done()))
      .collect()
  }

  /// The first dependency of `target` that can no longer be built.
  pub fn failed_dep(&self, target: &BuildTarget) -> Option<Label> {
    target.deps().into_iter().find(|dep| {
      if let Some(t) = self.target(dep) {
        return t.is_failed();
      }
      self
        .package(dep.package())
        .is_some_and(|p| p.state() == PackageState::Failed)
    })
  }
}
