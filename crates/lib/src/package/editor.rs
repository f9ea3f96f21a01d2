//! Staged package mutation.
//!
//! A [`PackageEditor`] only exists inside [`Package::enter_build_callback`],
//! so holding one proves the caller owns the package gate. Hooks stage edits
//! on it; the edits are validated and committed as one batch after the hook
//! returns.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Package, PackageError, Targets};
use crate::graph::{BuildGraph, EdgeKind, GraphError};
use crate::label::Label;
use crate::target::{BuildTarget, TargetSpec};
use crate::util::sync::write;

/// One change a hook wants to make to its package.
#[derive(Debug, Clone)]
pub enum GraphEdit {
  /// Declare a new target in the package.
  AddTarget(TargetSpec),
  /// Add a dependency (label or output file) to a target of the package.
  AddDep { target: String, dep: String },
  /// Declare an additional output file of a target of the package.
  AddOut { target: String, out: String },
}

/// What a committed callback actually added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackOutcome {
  pub new_targets: Vec<Label>,
  /// `(dependent, dependency)` pairs.
  pub new_edges: Vec<(Label, Label)>,
  pub new_outs: Vec<(Label, String)>,
}

impl CallbackOutcome {
  /// Whether any target, dependency or output was added.
  pub fn changed(&self) -> bool {
    !self.new_targets.is_empty() || !self.new_edges.is_empty() || !self.new_outs.is_empty()
  }
}

/// Exclusive, staged access to a package's target set.
#[derive(Debug)]
pub struct PackageEditor<'a> {
  package: &'a Package,
  edits: Vec<GraphEdit>,
}

impl<'a> PackageEditor<'a> {
  pub(crate) fn new(package: &'a Package) -> Self {
    Self {
      package,
      edits: Vec::new(),
    }
  }

  pub fn package(&self) -> &Package {
    self.package
  }

  pub fn target(&self, name: &str) -> Option<Arc<BuildTarget>> {
    self.package.target(name)
  }

  pub fn add_target(&mut self, spec: TargetSpec) {
    self.edits.push(GraphEdit::AddTarget(spec));
  }

  pub fn add_dep(&mut self, target: &str, dep: &str) {
    self.edits.push(GraphEdit::AddDep {
      target: target.to_string(),
      dep: dep.to_string(),
    });
  }

  pub fn add_out(&mut self, target: &str, out: &str) {
    self.edits.push(GraphEdit::AddOut {
      target: target.to_string(),
      out: out.to_string(),
    });
  }

  pub fn apply(&mut self, edit: GraphEdit) {
    self.edits.push(edit);
  }

  pub fn edits(&self) -> &[GraphEdit] {
    &self.edits
  }

  pub(crate) fn into_edits(self) -> Vec<GraphEdit> {
    self.edits
  }
}

/// Validate and apply a batch of edits. Called with the gate held.
///
/// Nothing is applied unless every edit resolves, the new edges keep the
/// dependency graph acyclic, and no dependency is added to a started target
/// other than `owner`. Edits that are already reflected in the package are
/// dropped, so committing the same batch twice changes nothing the second
/// time.
pub(crate) fn commit(
  package: &Package,
  graph: &BuildGraph,
  owner: &Label,
  edits: Vec<GraphEdit>,
) -> Result<CallbackOutcome, GraphError> {
  if edits.is_empty() {
    return Ok(CallbackOutcome::default());
  }

  let path = package.path();
  let sibling = Label::for_package(path);
  let mut targets = write(package.targets_lock());

  let mut new_specs: Vec<(Label, TargetSpec)> = Vec::new();
  let mut new_outputs: HashMap<String, String> = HashMap::new();
  let mut added_outs: Vec<(String, String)> = Vec::new();
  let mut dep_edits: Vec<(String, String)> = Vec::new();

  for edit in edits {
    match edit {
      GraphEdit::AddTarget(spec) => {
        let label = package.target_label(&spec.name)?;
        if targets.get(&spec.name).is_some() || new_specs.iter().any(|(l, _)| l == &label) {
          return Err(PackageError::DuplicateTarget(label).into());
        }
        for out in &spec.outs {
          claim_output(&targets, &mut new_outputs, &sibling, out, &spec.name)?;
        }
        new_specs.push((label, spec));
      }
      GraphEdit::AddOut { target, out } => {
        ensure_target(&targets, &new_specs, path, &target)?;
        let producer = new_outputs.get(&out).or_else(|| targets.outputs.get(&out));
        if producer == Some(&target) {
          continue;
        }
        claim_output(&targets, &mut new_outputs, &sibling, &out, &target)?;
        match new_specs.iter_mut().find(|(l, _)| l.name() == target) {
          Some((_, spec)) => spec.outs.push(out),
          None => added_outs.push((target, out)),
        }
      }
      GraphEdit::AddDep { target, dep } => {
        ensure_target(&targets, &new_specs, path, &target)?;
        dep_edits.push((target, dep));
      }
    }
  }

  let lookup = |out: &str| new_outputs.get(out).or_else(|| targets.outputs.get(out)).cloned();

  let mut edges: Vec<(Label, Label)> = Vec::new();
  let mut new_deps: Vec<Vec<Label>> = Vec::with_capacity(new_specs.len());
  for (label, spec) in &new_specs {
    let mut deps: Vec<Label> = Vec::new();
    for dep in &spec.deps {
      let dep = package.resolve_dep(dep, label, &lookup)?;
      if !deps.contains(&dep) {
        edges.push((label.clone(), dep.clone()));
        deps.push(dep);
      }
    }
    new_deps.push(deps);
  }

  let mut added_deps: Vec<(Arc<BuildTarget>, Label)> = Vec::new();
  for (target, dep) in dep_edits {
    let dependent = sibling.with_name(&target);
    let dep = package.resolve_dep(&dep, &dependent, &lookup)?;

    if let Some(idx) = new_specs.iter().position(|(l, _)| l.name() == target) {
      if !new_deps[idx].contains(&dep) {
        edges.push((dependent, dep.clone()));
        new_deps[idx].push(dep);
      }
      continue;
    }

    let Some(existing) = targets.get(&target).cloned() else {
      continue;
    };
    if existing.has_dep(&dep) || added_deps.iter().any(|(t, d)| Arc::ptr_eq(t, &existing) && d == &dep) {
      continue;
    }
    edges.push((dependent, dep.clone()));
    added_deps.push((existing, dep));
  }

  // A cyclic edit is reported as a cycle even when it also targets a
  // started target.
  graph.check_edges(&edges, EdgeKind::Dynamic)?;
  if let Some((target, dep)) = added_deps
    .iter()
    .find(|(t, _)| t.label() != owner && t.state().has_started())
  {
    return Err(frozen(target, dep));
  }

  // Targets start outside the gate, so the state is checked again as each
  // dependency is appended.
  let mut applied: Vec<(Arc<BuildTarget>, Label)> = Vec::new();
  for (target, dep) in added_deps {
    match target.add_dep(dep.clone(), target.label() == owner) {
      Ok(true) => applied.push((target, dep)),
      Ok(false) => {}
      Err(_) => {
        unapply(&applied);
        return Err(frozen(&target, &dep));
      }
    }
  }
  if let Err(err) = graph.link(&edges, EdgeKind::Dynamic) {
    unapply(&applied);
    return Err(err);
  }

  let mut outcome = CallbackOutcome::default();

  for (name, out) in added_outs {
    if let Some(target) = targets.get(&name).cloned()
      && target.add_out(&out)
    {
      targets.outputs.insert(out.clone(), name);
      outcome.new_outs.push((target.label().clone(), out));
    }
  }

  for (target, dep) in applied {
    outcome.new_edges.push((target.label().clone(), dep));
  }

  for ((label, spec), deps) in new_specs.into_iter().zip(new_deps) {
    for dep in &deps {
      outcome.new_edges.push((label.clone(), dep.clone()));
    }
    for out in &spec.outs {
      outcome.new_outs.push((label.clone(), out.clone()));
    }
    debug!(target_label = %label, deps = deps.len(), "hook added target");
    outcome.new_targets.push(label.clone());
    targets.insert(Arc::new(BuildTarget::new(label, spec, deps)));
  }

  Ok(outcome)
}

fn frozen(target: &BuildTarget, dep: &Label) -> GraphError {
  PackageError::Frozen {
    target: target.label().clone(),
    dep: dep.clone(),
  }
  .into()
}

fn unapply(applied: &[(Arc<BuildTarget>, Label)]) {
  for (target, dep) in applied {
    target.remove_dep(dep);
  }
}

fn ensure_target(targets: &Targets, new_specs: &[(Label, TargetSpec)], package: &str, name: &str) -> Result<(), PackageError> {
  if targets.get(name).is_some() || new_specs.iter().any(|(l, _)| l.name() == name) {
    return Ok(());
  }
  Err(PackageError::UnknownTarget {
    package: package.to_string(),
    name: name.to_string(),
  })
}

fn claim_output(
  targets: &Targets,
  new_outputs: &mut HashMap<String, String>,
  sibling: &Label,
  out: &str,
  owner: &str,
) -> Result<(), PackageError> {
  let existing = new_outputs.get(out).or_else(|| targets.outputs.get(out));
  if let Some(producer) = existing
    && producer != owner
  {
    return Err(PackageError::DuplicateOutput {
      output: out.to_string(),
      label: sibling.with_name(owner),
      producer: sibling.with_name(producer),
    });
  }
  new_outputs.insert(out.to_string(), owner.to_string());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::target::TargetState;

  fn setup() -> (BuildGraph, Arc<Package>) {
    let graph = BuildGraph::new("/tmp/repo");
    let (pkg, _) = graph.get_or_create_package("pkg");
    pkg
      .populate(vec![TargetSpec::new("a").with_outs(["a.h"]), TargetSpec::new("b").with_deps([":a"])])
      .unwrap();
    for target in pkg.targets() {
      graph.link_target(&target, EdgeKind::Static).unwrap();
    }
    (graph, pkg)
  }

  fn edit<F>(graph: &BuildGraph, pkg: &Package, f: F) -> Result<CallbackOutcome, GraphError>
  where
    F: FnOnce(&mut PackageEditor<'_>),
  {
    edit_as(graph, pkg, "a", f)
  }

  /// Commit `f`'s edits as if the hook of target `owner` ran them.
  fn edit_as<F>(graph: &BuildGraph, pkg: &Package, owner: &str, f: F) -> Result<CallbackOutcome, GraphError>
  where
    F: FnOnce(&mut PackageEditor<'_>),
  {
    let owner = Label::new(pkg.path(), owner).unwrap();
    pkg.enter_build_callback(graph, &owner, |editor| {
      f(editor);
      Ok::<_, GraphError>(())
    })
  }

  mod commit {
    use super::*;

    #[test]
    fn empty_batch_is_unchanged() {
      let (graph, pkg) = setup();
      let outcome = edit(&graph, &pkg, |_| {}).unwrap();
      assert!(!outcome.changed());
    }

    #[test]
    fn adds_target_resolving_outputs() {
      let (graph, pkg) = setup();
      let outcome = edit(&graph, &pkg, |e| {
        e.add_out("b", "foo.h");
        e.add_target(TargetSpec::new("c").with_deps(["foo.h", "a.h"]));
      })
      .unwrap();

      assert!(outcome.changed());
      let c = pkg.target("c").unwrap();
      let deps: Vec<_> = c.deps().iter().map(|l| l.name().to_string()).collect();
      assert_eq!(deps, vec!["b", "a"]);
      assert_eq!(pkg.producer_of("foo.h").as_deref(), Some("b"));
      assert!(graph.has_edge(c.label(), &Label::new("pkg", "b").unwrap()));
    }

    #[test]
    fn recommit_is_noop() {
      let (graph, pkg) = setup();
      edit(&graph, &pkg, |e| e.add_dep("b", "a.h")).unwrap();
      let outcome = edit(&graph, &pkg, |e| {
        e.add_dep("b", ":a");
        e.add_out("a", "a.h");
      })
      .unwrap();
      assert!(!outcome.changed());
    }

    #[test]
    fn cycle_commits_nothing() {
      let (graph, pkg) = setup();
      let edges_before = graph.edge_count();
      let err = edit(&graph, &pkg, |e| {
        e.add_target(TargetSpec::new("d"));
        e.add_dep("a", ":b");
      })
      .unwrap_err();

      assert!(matches!(err, GraphError::Cycle { kind: EdgeKind::Dynamic, .. }));
      assert!(pkg.target("d").is_none());
      assert!(pkg.target("a").unwrap().deps().is_empty());
      assert_eq!(graph.edge_count(), edges_before);
    }

    #[test]
    fn unknown_target_rejected() {
      let (graph, pkg) = setup();
      let err = edit(&graph, &pkg, |e| e.add_dep("nope", ":a")).unwrap_err();
      assert!(matches!(err, GraphError::Package(PackageError::UnknownTarget { .. })));
    }

    #[test]
    fn frozen_after_done() {
      let (graph, pkg) = setup();
      pkg.populate(vec![TargetSpec::new("z")]).unwrap();
      let b = pkg.target("b").unwrap();
      b.transition(TargetState::ParsingDeps).unwrap();
      b.transition(TargetState::Building).unwrap();
      b.transition(TargetState::Done).unwrap();

      let err = edit(&graph, &pkg, |e| e.add_dep("b", ":z")).unwrap_err();
      assert!(matches!(err, GraphError::Package(PackageError::Frozen { .. })));
      assert!(!graph.has_edge(b.label(), &Label::new("pkg", "z").unwrap()));
    }

    #[test]
    fn frozen_while_sibling_builds() {
      let (graph, pkg) = setup();
      pkg.populate(vec![TargetSpec::new("z")]).unwrap();
      let b = pkg.target("b").unwrap();
      b.transition(TargetState::ParsingDeps).unwrap();
      b.transition(TargetState::Building).unwrap();

      let err = edit(&graph, &pkg, |e| {
        e.add_target(TargetSpec::new("extra"));
        e.add_dep("b", ":z");
      })
      .unwrap_err();

      assert!(matches!(err, GraphError::Package(PackageError::Frozen { .. })));
      assert!(pkg.target("extra").is_none());
      assert_eq!(b.deps(), vec![Label::new("pkg", "a").unwrap()]);
      assert!(!graph.has_edge(b.label(), &Label::new("pkg", "z").unwrap()));
    }

    #[test]
    fn owner_may_extend_itself_after_starting() {
      let (graph, pkg) = setup();
      pkg.populate(vec![TargetSpec::new("z")]).unwrap();
      let b = pkg.target("b").unwrap();
      b.transition(TargetState::ParsingDeps).unwrap();
      b.transition(TargetState::Building).unwrap();
      b.transition(TargetState::PostBuild).unwrap();

      let outcome = edit_as(&graph, &pkg, "b", |e| e.add_dep("b", ":z")).unwrap();

      assert!(outcome.changed());
      assert!(b.has_dep(&Label::new("pkg", "z").unwrap()));
      assert!(graph.has_edge(b.label(), &Label::new("pkg", "z").unwrap()));
    }

    #[test]
    fn waiting_sibling_takes_new_dep() {
      let (graph, pkg) = setup();
      pkg.populate(vec![TargetSpec::new("z")]).unwrap();
      let b = pkg.target("b").unwrap();
      b.transition(TargetState::ParsingDeps).unwrap();

      edit(&graph, &pkg, |e| e.add_dep("b", ":z")).unwrap();
      assert!(b.has_dep(&Label::new("pkg", "z").unwrap()));
    }

    #[test]
    fn package_pseudo_target_name_is_reserved() {
      let (graph, pkg) = setup();
      let err = edit(&graph, &pkg, |e| e.add_target(TargetSpec::new("all"))).unwrap_err();
      assert!(matches!(err, GraphError::Package(PackageError::ReservedName { .. })));
      assert!(pkg.target("all").is_none());
    }

    #[test]
    fn hook_error_commits_nothing() {
      let (graph, pkg) = setup();
      let owner = Label::new("pkg", "a").unwrap();
      let result = pkg.enter_build_callback(&graph, &owner, |e| {
        e.add_target(TargetSpec::new("d"));
        Err(GraphError::MissingTarget {
          label: Label::new("x", "y").unwrap(),
          referenced_by: Label::new("pkg", "d").unwrap(),
        })
      });
      assert!(result.is_err());
      assert!(pkg.target("d").is_none());
    }
  }
}
