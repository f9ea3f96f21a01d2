//! Running a target's build action.
//!
//! The scheduler only needs the captured output of an action, which is what
//! a target's post-build hook receives. [`ShellRunner`] is the runner used by
//! the CLI; tests substitute canned outputs.

use std::future::Future;
use std::path::Path;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::target::BuildTarget;

#[derive(Debug, Error)]
pub enum ActionError {
  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  #[error("failed to spawn '{shell}': {source}")]
  Spawn {
    shell: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{0}")]
  Failed(String),
}

/// Executes the action of one target and returns its output.
pub trait ActionRunner: Send + Sync + 'static {
  fn run(
    &self,
    package_dir: &Path,
    target: &BuildTarget,
  ) -> impl Future<Output = Result<String, ActionError>> + Send;
}

/// Runs `cmd` with `shell -c` inside the package directory.
///
/// Targets without a command produce empty output.
#[derive(Debug, Clone)]
pub struct ShellRunner {
  shell: String,
}

impl ShellRunner {
  pub fn new(shell: impl Into<String>) -> Self {
    Self { shell: shell.into() }
  }
}

impl Default for ShellRunner {
  fn default() -> Self {
    Self::new("/bin/sh")
  }
}

impl ActionRunner for ShellRunner {
  async fn run(&self, package_dir: &Path, target: &BuildTarget) -> Result<String, ActionError> {
    let Some(cmd) = target.cmd() else {
      return Ok(String::new());
    };
    info!(target_label = %target.label(), cmd = %cmd, "executing command");

    let output = Command::new(&self.shell)
      .arg("-c")
      .arg(cmd)
      .current_dir(package_dir)
      .env("KILN_LABEL", target.label().to_string())
      .env("KILN_PACKAGE", target.label().package())
      .output()
      .await
      .map_err(|source| ActionError::Spawn {
        shell: self.shell.clone(),
        source,
      })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }

    if !output.status.success() {
      return Err(ActionError::CmdFailed {
        cmd: cmd.to_string(),
        code: output.status.code(),
      });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command output");
    }
    Ok(stdout)
  }
}
