//! Pre- and post-build hooks.
//!
//! Hooks are opaque callables bound to a target by the parser engine that
//! declared it. The core only knows how to invoke them and observe success or
//! failure; everything a hook wants to change goes through the
//! [`PackageEditor`] it is handed.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::BuildTarget;
use crate::package::PackageEditor;

/// Shared handle to a hook.
pub type Hook = Arc<dyn BuildHook>;

/// Which of the two hook slots is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
  PreBuild,
  PostBuild,
}

impl HookKind {
  pub fn as_str(self) -> &'static str {
    match self {
      HookKind::PreBuild => "pre",
      HookKind::PostBuild => "post",
    }
  }
}

impl fmt::Display for HookKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-build", self.as_str())
  }
}

/// Errors raised by a hook body.
#[derive(Debug, Error)]
pub enum HookError {
  #[error("lua error: {0}")]
  Lua(#[from] mlua::Error),

  #[error("{0}")]
  Failed(String),

  /// The engine that declared this hook cannot execute it.
  #[error("hook '{0}' cannot be executed by this engine")]
  Unsupported(String),
}

/// A callable bound to a target and run around its build action.
///
/// `output` is `None` for pre-build hooks and the captured build output for
/// post-build hooks. Edits staged on `editor` are committed only if the hook
/// returns `Ok`.
pub trait BuildHook: Send + Sync + fmt::Debug {
  fn call(&self, target: &BuildTarget, output: Option<&str>, editor: &mut PackageEditor<'_>) -> Result<(), HookError>;
}

/// A hook declared by name in a build file whose engine has no way to run it.
#[derive(Debug, Clone)]
pub struct DeclaredHook {
  name: String,
}

impl DeclaredHook {
  pub fn new(name: &str) -> Self {
    Self { name: name.to_string() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl BuildHook for DeclaredHook {
  fn call(&self, _target: &BuildTarget, _output: Option<&str>, _editor: &mut PackageEditor<'_>) -> Result<(), HookError> {
    Err(HookError::Unsupported(self.name.clone()))
  }
}
