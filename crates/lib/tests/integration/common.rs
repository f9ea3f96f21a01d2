//! Shared fixtures: temporary repositories and a canned action runner.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use kiln_lib::build::{ActionError, ActionRunner, BuildError, BuildSummary, build};
use kiln_lib::config::Config;
use kiln_lib::label::Label;
use kiln_lib::package::Package;
use kiln_lib::parse::parse_package;
use kiln_lib::state::BuildState;
use kiln_lib::target::BuildTarget;
use tempfile::TempDir;

pub fn l(s: &str) -> Label {
  s.parse().unwrap()
}

/// A repository in a temporary directory.
pub struct TestRepo {
  dir: TempDir,
}

impl TestRepo {
  pub fn new(files: &[(&str, &str)]) -> Self {
    let dir = TempDir::new().unwrap();
    for (path, content) in files {
      let path = dir.path().join(path);
      fs::create_dir_all(path.parent().unwrap()).unwrap();
      fs::write(path, content).unwrap();
    }
    Self { dir }
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  pub fn config(&self) -> Config {
    Config::load(self.path()).unwrap()
  }

  pub fn state(&self) -> Arc<BuildState> {
    Arc::new(BuildState::new(self.path(), self.config()).unwrap())
  }
}

/// Parse `path` synchronously, as a worker would.
pub fn parse(state: &BuildState, path: &str) -> Arc<Package> {
  let (pkg, _) = state.graph().get_or_create_package(path);
  parse_package(0, state, &pkg).unwrap();
  pkg
}

/// Action runner that returns fixed outputs instead of running commands.
#[derive(Default)]
pub struct Canned {
  outputs: HashMap<Label, String>,
  failures: HashMap<Label, String>,
  ran: Mutex<Vec<Label>>,
}

impl Canned {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn output(mut self, label: &str, output: &str) -> Self {
    self.outputs.insert(l(label), output.to_string());
    self
  }

  pub fn fail(mut self, label: &str, message: &str) -> Self {
    self.failures.insert(l(label), message.to_string());
    self
  }

  /// Labels whose action ran, in order.
  pub fn ran(&self) -> Vec<Label> {
    self.ran.lock().unwrap().clone()
  }
}

impl ActionRunner for Canned {
  async fn run(&self, _package_dir: &Path, target: &BuildTarget) -> Result<String, ActionError> {
    let label = target.label();
    self.ran.lock().unwrap().push(label.clone());
    if let Some(message) = self.failures.get(label) {
      return Err(ActionError::Failed(message.clone()));
    }
    Ok(self.outputs.get(label).cloned().unwrap_or_default())
  }
}

pub async fn run(state: &Arc<BuildState>, runner: &Arc<Canned>, labels: &[&str]) -> Result<BuildSummary, BuildError> {
  let labels: Vec<Label> = labels.iter().map(|s| l(s)).collect();
  build(Arc::clone(state), Arc::clone(runner), &labels).await
}

pub fn sorted(mut labels: Vec<Label>) -> Vec<Label> {
  labels.sort();
  labels
}
