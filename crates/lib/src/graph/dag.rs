//! Label-keyed dependency DAG.
//!
//! Edges point from a dependency to its dependent, so a topological order is
//! a valid build order. Unlike a DAG built once from a fixed manifest, this
//! one grows while the build runs, so acyclicity is checked on every insert.

use std::collections::{HashMap, VecDeque};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::label::Label;

/// Nodes and edges added by one batch, kept so the batch can be undone.
#[derive(Debug, Default)]
struct Applied {
  nodes: Vec<NodeIndex>,
  edges: Vec<EdgeIndex>,
}

#[derive(Debug, Default)]
pub struct DependencyDag {
  graph: DiGraph<Label, ()>,
  nodes: HashMap<Label, NodeIndex>,
}

impl DependencyDag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn edge_count(&self) -> usize {
    self.graph.edge_count()
  }

  /// Whether `dependent` already depends directly on `dep`.
  pub fn contains_edge(&self, dependent: &Label, dep: &Label) -> bool {
    match (self.nodes.get(dep), self.nodes.get(dependent)) {
      (Some(&from), Some(&to)) => self.graph.contains_edge(from, to),
      _ => false,
    }
  }

  /// Direct dependencies of `label`.
  pub fn dependencies(&self, label: &Label) -> Vec<Label> {
    self.neighbors(label, Direction::Incoming)
  }

  /// Targets that depend directly on `label`.
  pub fn dependents(&self, label: &Label) -> Vec<Label> {
    self.neighbors(label, Direction::Outgoing)
  }

  fn neighbors(&self, label: &Label, direction: Direction) -> Vec<Label> {
    let Some(&idx) = self.nodes.get(label) else {
      return Vec::new();
    };
    let mut out: Vec<Label> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out
  }

  /// Labels with dependencies before their dependents.
  pub fn topological_order(&self) -> Vec<Label> {
    // Insertion keeps the graph acyclic, so the sort cannot fail.
    toposort(&self.graph, None)
      .map(|order| order.into_iter().map(|idx| self.graph[idx].clone()).collect())
      .unwrap_or_default()
  }

  /// Check whether a batch of `(dependent, dependency)` edges could be
  /// inserted, without changing the graph.
  pub fn check(&mut self, edges: &[(Label, Label)]) -> Result<(), Vec<Label>> {
    let applied = self.apply(edges)?;
    self.rollback(applied);
    Ok(())
  }

  /// Insert a batch of `(dependent, dependency)` edges.
  ///
  /// Either every edge is inserted or, if one of them would close a cycle,
  /// none is and the cycle is returned as a chain of labels, each depending
  /// on the next, starting and ending at the same label. Edges that already
  /// exist are skipped. Returns the number of edges actually added.
  pub fn insert_edges(&mut self, edges: &[(Label, Label)]) -> Result<usize, Vec<Label>> {
    self.apply(edges).map(|applied| applied.edges.len())
  }

  fn apply(&mut self, edges: &[(Label, Label)]) -> Result<Applied, Vec<Label>> {
    let mut applied = Applied::default();

    for (dependent, dep) in edges {
      let to = self.node(dependent, &mut applied);
      let from = self.node(dep, &mut applied);

      if self.graph.contains_edge(from, to) {
        continue;
      }

      if let Some(cycle) = self.find_path(to, from) {
        self.rollback(applied);
        let mut chain = vec![dependent.clone()];
        chain.extend(cycle);
        return Err(chain);
      }

      applied.edges.push(self.graph.add_edge(from, to, ()));
    }

    Ok(applied)
  }

  /// Undo a batch. Indices are removed newest first, which keeps every other
  /// index stable.
  fn rollback(&mut self, applied: Applied) {
    for edge in applied.edges.into_iter().rev() {
      self.graph.remove_edge(edge);
    }
    for node in applied.nodes.into_iter().rev() {
      if let Some(label) = self.graph.remove_node(node) {
        self.nodes.remove(&label);
      }
    }
  }

  fn node(&mut self, label: &Label, applied: &mut Applied) -> NodeIndex {
    if let Some(&idx) = self.nodes.get(label) {
      return idx;
    }
    let idx = self.graph.add_node(label.clone());
    self.nodes.insert(label.clone(), idx);
    applied.nodes.push(idx);
    idx
  }

  /// Breadth-first search along edge direction from `start` to `goal`.
  ///
  /// A path from the dependent to the dependency means the dependency already
  /// depends on the dependent. The path is returned in "depends on" order:
  /// `goal` first, `start` last.
  fn find_path(&self, start: NodeIndex, goal: NodeIndex) -> Option<Vec<Label>> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut found = start == goal;

    while let Some(idx) = queue.pop_front() {
      if found {
        break;
      }
      for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
        let next = edge.target();
        if next == start || parent.contains_key(&next) {
          continue;
        }
        parent.insert(next, idx);
        if next == goal {
          found = true;
          break;
        }
        queue.push_back(next);
      }
    }

    if !found {
      return None;
    }

    let mut path = vec![self.graph[goal].clone()];
    let mut cursor = goal;
    while cursor != start {
      cursor = parent[&cursor];
      path.push(self.graph[cursor].clone());
    }
    Some(path)
  }
}
