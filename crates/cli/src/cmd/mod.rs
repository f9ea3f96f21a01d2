mod build;
mod targets;

use std::path::Path;

use anyhow::{Context, Result};

use kiln_lib::config::Config;

pub use build::{BuildArgs, cmd_build};
pub use targets::cmd_targets;

/// Load `.kiln.toml` from `root`, or the file given with `--config`.
fn load_config(root: &Path, config: Option<&Path>) -> Result<Config> {
  match config {
    Some(path) => Config::from_file(path).with_context(|| format!("Failed to load config: {}", path.display())),
    None => Config::load(root).with_context(|| format!("Failed to load config from {}", root.display())),
  }
}
