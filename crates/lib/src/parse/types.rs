use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{ConfigError, Engine};
use crate::graph::GraphError;
use crate::label::Label;
use crate::package::PackageError;
use crate::target::{HookError, HookKind};

/// Errors raised by parser engines and by the hooks they run.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// The engine has no way to run the requested feature.
  #[error("{feature} not implemented by the {engine} engine (used by {label})")]
  NotImplemented {
    engine: Engine,
    feature: String,
    label: Label,
  },

  #[error("no build file for package //{package} (looked for {})", names.join(", "))]
  NoBuildFile { package: String, names: Vec<String> },

  #[error("failed to read {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("error evaluating {}: {source}", path.display())]
  Lua {
    path: PathBuf,
    #[source]
    source: mlua::Error,
  },

  #[error("invalid build file {}: {source}", path.display())]
  Toml {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("{}:{line}: {message}", path.display())]
  Syntax {
    path: PathBuf,
    line: usize,
    message: String,
  },

  #[error(transparent)]
  Package(#[from] PackageError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("{kind} function of {label} failed: {source}")]
  Hook {
    label: Label,
    kind: HookKind,
    #[source]
    source: HookError,
  },
}

impl ParseError {
  /// Configuration problems, unsupported features and static cycles abort
  /// the whole build. Everything else is reported against one package or
  /// target.
  pub fn is_fatal(&self) -> bool {
    match self {
      ParseError::Config(_) | ParseError::NotImplemented { .. } => true,
      ParseError::Graph(err) => err.is_fatal(),
      _ => false,
    }
  }
}
