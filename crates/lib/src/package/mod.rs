//! Packages: the parsed contents of one build file.
//!
//! A package owns its targets in declaration order and carries the single
//! serialization point for build-time mutation: the build-callback gate.
//! Any number of workers may build targets of the same package in parallel,
//! but only the holder of the gate may add targets, dependencies or outputs.
//!
//! # Submodules
//!
//! - [`editor`] - Staged edits applied by a hook under the gate

pub mod editor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::graph::{BuildGraph, GraphError};
use crate::label::{Label, LabelError, PACKAGE_PSEUDO_TARGET};
use crate::target::{BuildTarget, TargetSpec};
use crate::util::sync::{lock, read, write};

pub use editor::{CallbackOutcome, GraphEdit, PackageEditor};

/// Errors raised while registering or mutating a package's targets.
#[derive(Debug, Error)]
pub enum PackageError {
  #[error("target {0} is already defined")]
  DuplicateTarget(Label),

  #[error("no target named '{name}' in package //{package}")]
  UnknownTarget { package: String, name: String },

  #[error("{referenced_by} depends on '{output}' but no target in //{package} produces it")]
  UnknownOutput {
    package: String,
    output: String,
    referenced_by: Label,
  },

  #[error("output '{output}' of {label} is already produced by {producer}")]
  DuplicateOutput {
    output: String,
    label: Label,
    producer: Label,
  },

  #[error("invalid dependency '{dep}' of {target}: {source}")]
  InvalidDependency {
    target: Label,
    dep: String,
    #[source]
    source: LabelError,
  },

  #[error("invalid target name: {0}")]
  InvalidName(#[from] LabelError),

  #[error("cannot add dependency {dep} to {target}: it has already started building")]
  Frozen { target: Label, dep: Label },

  #[error("target name '{name}' is reserved in //{package}: //{package}:{name} names the whole package")]
  ReservedName { package: String, name: String },

  #[error("package //{0} has already been parsed")]
  AlreadyParsed(String),
}

/// Parse progress of a package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PackageState {
  /// Referenced but not yet handed to the parser.
  #[default]
  Empty,
  /// The parser engine is evaluating the build file.
  Parsing,
  /// Targets are registered; some dependencies may still be unresolved.
  Parsed,
  /// Every dependency of every target has been resolved.
  Resolved,
  /// The build file could not be parsed.
  Failed,
}

/// Target storage. Only the parser (before the package is published) and the
/// holder of the build-callback gate ever take the write lock.
#[derive(Debug, Default)]
pub(crate) struct Targets {
  pub(crate) order: Vec<Arc<BuildTarget>>,
  pub(crate) by_name: HashMap<String, usize>,
  /// Output file -> name of the producing target.
  pub(crate) outputs: HashMap<String, String>,
}

impl Targets {
  pub(crate) fn get(&self, name: &str) -> Option<&Arc<BuildTarget>> {
    self.by_name.get(name).map(|&idx| &self.order[idx])
  }

  pub(crate) fn insert(&mut self, target: Arc<BuildTarget>) {
    let name = target.label().name().to_string();
    for out in target.outs() {
      self.outputs.insert(out, name.clone());
    }
    self.by_name.insert(name, self.order.len());
    self.order.push(target);
  }
}

/// The parsed result of one build file.
#[derive(Debug)]
pub struct Package {
  path: String,
  dir: PathBuf,
  gate: Mutex<()>,
  targets: RwLock<Targets>,
  state: Mutex<PackageState>,
  build_file: Mutex<Option<PathBuf>>,
}

impl Package {
  pub fn new(path: &str, dir: impl Into<PathBuf>) -> Self {
    Self {
      path: path.to_string(),
      dir: dir.into(),
      gate: Mutex::new(()),
      targets: RwLock::new(Targets::default()),
      state: Mutex::new(PackageState::Empty),
      build_file: Mutex::new(None),
    }
  }

  /// Package path, e.g. `src/core` (empty for the root package).
  pub fn path(&self) -> &str {
    &self.path
  }

  /// Directory on disk holding the build file.
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Pseudo label used to report against the package as a whole.
  pub fn label(&self) -> Label {
    Label::for_package(&self.path)
  }

  pub fn state(&self) -> PackageState {
    *lock(&self.state)
  }

  pub(crate) fn set_state(&self, state: PackageState) {
    *lock(&self.state) = state;
  }

  /// Claim the package for parsing. Only the first caller succeeds, so each
  /// package is handed to the parser engine exactly once.
  pub(crate) fn begin_parse(&self) -> Result<(), PackageError> {
    let mut state = lock(&self.state);
    if *state != PackageState::Empty {
      return Err(PackageError::AlreadyParsed(self.path.clone()));
    }
    *state = PackageState::Parsing;
    Ok(())
  }

  pub fn is_parsed(&self) -> bool {
    matches!(self.state(), PackageState::Parsed | PackageState::Resolved)
  }

  pub fn build_file(&self) -> Option<PathBuf> {
    lock(&self.build_file).clone()
  }

  pub(crate) fn set_build_file(&self, path: &Path) {
    *lock(&self.build_file) = Some(path.to_path_buf());
  }

  pub fn target(&self, name: &str) -> Option<Arc<BuildTarget>> {
    read(&self.targets).get(name).cloned()
  }

  /// All targets in declaration order.
  pub fn targets(&self) -> Vec<Arc<BuildTarget>> {
    read(&self.targets).order.clone()
  }

  pub fn len(&self) -> usize {
    read(&self.targets).order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Name of the target declaring `output`, if any.
  pub fn producer_of(&self, output: &str) -> Option<String> {
    read(&self.targets).outputs.get(output).cloned()
  }

  /// Labels of targets whose post-build hook has not finished yet. Any of
  /// them may still add targets to this package.
  pub fn pending_post_build_hooks(&self) -> Vec<Label> {
    read(&self.targets)
      .order
      .iter()
      .filter(|t| t.post_build_pending())
      .map(|t| t.label().clone())
      .collect()
  }

  /// Register the targets discovered by a parser engine.
  ///
  /// Either every spec is registered or none is. Dependencies written as
  /// output files are resolved against the outputs declared in this package,
  /// including those of targets declared later in the same file.
  pub fn populate(&self, specs: Vec<TargetSpec>) -> Result<(), PackageError> {
    let mut targets = write(&self.targets);

    let mut labels = Vec::with_capacity(specs.len());
    let mut outputs: HashMap<String, String> = HashMap::new();
    for spec in &specs {
      let label = self.target_label(&spec.name)?;
      if targets.get(&spec.name).is_some() || labels.contains(&label) {
        return Err(PackageError::DuplicateTarget(label));
      }
      for out in &spec.outs {
        let existing = outputs.get(out).or_else(|| targets.outputs.get(out));
        if let Some(producer) = existing {
          return Err(PackageError::DuplicateOutput {
            output: out.clone(),
            label,
            producer: Label::for_package(&self.path).with_name(producer),
          });
        }
        outputs.insert(out.clone(), spec.name.clone());
      }
      labels.push(label);
    }

    let mut resolved = Vec::with_capacity(specs.len());
    for (spec, label) in specs.iter().zip(&labels) {
      let mut deps: Vec<Label> = Vec::with_capacity(spec.deps.len());
      for dep in &spec.deps {
        let dep = self.resolve_dep(dep, label, |out| {
          outputs.get(out).or_else(|| targets.outputs.get(out)).cloned()
        })?;
        if !deps.contains(&dep) {
          deps.push(dep);
        }
      }
      resolved.push(deps);
    }

    for ((spec, label), deps) in specs.into_iter().zip(labels).zip(resolved) {
      debug!(target_label = %label, deps = deps.len(), "registered target");
      targets.insert(Arc::new(BuildTarget::new(label, spec, deps)));
    }

    Ok(())
  }

  /// Label for a target declared in this package.
  pub(crate) fn target_label(&self, name: &str) -> Result<Label, PackageError> {
    if name == PACKAGE_PSEUDO_TARGET {
      return Err(PackageError::ReservedName {
        package: self.path.clone(),
        name: name.to_string(),
      });
    }
    Ok(Label::new(self.path.as_str(), name)?)
  }

  /// Resolve a dependency string written inside this package.
  pub(crate) fn resolve_dep(
    &self,
    dep: &str,
    dependent: &Label,
    producer: impl Fn(&str) -> Option<String>,
  ) -> Result<Label, PackageError> {
    if Label::looks_like_label(dep) {
      return Label::parse_relative(dep, &self.path).map_err(|source| PackageError::InvalidDependency {
        target: dependent.clone(),
        dep: dep.to_string(),
        source,
      });
    }

    match producer(dep) {
      Some(name) => Ok(Label::for_package(&self.path).with_name(&name)),
      None => Err(PackageError::UnknownOutput {
        package: self.path.clone(),
        output: dep.to_string(),
        referenced_by: dependent.clone(),
      }),
    }
  }

  /// Run `f` with exclusive permission to mutate this package.
  ///
  /// The gate is held for the whole of `f` and the commit of its staged
  /// edits, and is released on every exit path. Edits are only committed when
  /// `f` succeeds and the resulting edges keep the graph acyclic; otherwise
  /// the package is left exactly as it was. The returned outcome lists what
  /// was actually added, and is empty when nothing changed.
  ///
  /// `owner` is the target whose hook is running. It is the only target that
  /// may gain dependencies after it has started building; adding one to any
  /// other started target fails with [`PackageError::Frozen`].
  pub fn enter_build_callback<E, F>(&self, graph: &BuildGraph, owner: &Label, f: F) -> Result<CallbackOutcome, E>
  where
    F: FnOnce(&mut PackageEditor<'_>) -> Result<(), E>,
    E: From<GraphError>,
  {
    let _gate = lock(&self.gate);
    let mut editor = PackageEditor::new(self);
    f(&mut editor)?;
    let edits = editor.into_edits();
    Ok(editor::commit(self, graph, owner, edits)?)
  }

  pub(crate) fn targets_lock(&self) -> &RwLock<Targets> {
    &self.targets
  }
}
