//! Repository configuration (`.kiln.toml`).
//!
//! Every field has a default, so a repository without a config file builds
//! with the Lua engine and one worker per CPU.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file at the repository root.
pub const CONFIG_FILE: &str = ".kiln.toml";

/// Errors raised while loading configuration. All of them are fatal: they
/// are raised before any package is parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {}: {source}", path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("unknown parser engine '{0}' (expected one of: lua, toml, script)")]
  UnknownEngine(String),

  #[error("failed to read preload {}: {source}", path.display())]
  Preload {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid preload {}: {message}", path.display())]
  InvalidPreload { path: PathBuf, message: String },

  #[error("build.parallelism must be at least 1")]
  ZeroParallelism,
}

/// The parser engine variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
  /// Embedded Lua; the only engine that can run hooks.
  Lua,
  /// Declarative TOML build files.
  Toml,
  /// The legacy line-oriented build script format.
  Script,
}

impl Engine {
  pub fn as_str(self) -> &'static str {
    match self {
      Engine::Lua => "lua",
      Engine::Toml => "toml",
      Engine::Script => "script",
    }
  }

  pub fn default_build_file(self) -> &'static str {
    match self {
      Engine::Lua => "BUILD.lua",
      Engine::Toml => "BUILD.toml",
      Engine::Script => "BUILD",
    }
  }
}

impl fmt::Display for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Engine {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "lua" => Ok(Engine::Lua),
      "toml" => Ok(Engine::Toml),
      "script" => Ok(Engine::Script),
      other => Err(ConfigError::UnknownEngine(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParseConfig {
  /// Engine name. Kept as text so an unknown value is only rejected when the
  /// parser is initialised.
  pub engine: String,
  /// Build definitions evaluated before every build file, relative to the
  /// repository root.
  pub preload_build_defs: Vec<PathBuf>,
  /// File names recognised as build files, in priority order. Empty means
  /// the engine's default.
  pub build_file_names: Vec<String>,
}

impl Default for ParseConfig {
  fn default() -> Self {
    Self {
      engine: Engine::Lua.as_str().to_string(),
      preload_build_defs: Vec::new(),
      build_file_names: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
  /// Maximum number of concurrent parse and build tasks.
  pub parallelism: usize,
  /// Stop starting new work after the first failure.
  pub fail_fast: bool,
  /// Shell used to run target commands.
  pub shell: String,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      fail_fast: false,
      shell: "/bin/sh".to_string(),
    }
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub parse: ParseConfig,
  pub build: BuildConfig,
}

impl Config {
  /// Load `.kiln.toml` from `root`, falling back to defaults when absent.
  pub fn load(root: &Path) -> Result<Self, ConfigError> {
    let path = root.join(CONFIG_FILE);
    match fs::read_to_string(&path) {
      Ok(content) => Self::parse(&content, &path),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
      Err(source) => Err(ConfigError::Read { path, source }),
    }
  }

  /// Load an explicit config file, which must exist.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content, path)
  }

  fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
    let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: Box::new(e),
    })?;
    if config.build.parallelism == 0 {
      return Err(ConfigError::ZeroParallelism);
    }
    Ok(config)
  }

  /// The selected engine.
  pub fn engine(&self) -> Result<Engine, ConfigError> {
    self.parse.engine.parse()
  }

  /// Build file names to look for, falling back to the engine default.
  pub fn build_file_names(&self, engine: Engine) -> Vec<String> {
    if self.parse.build_file_names.is_empty() {
      vec![engine.default_build_file().to_string()]
    } else {
      self.parse.build_file_names.clone()
    }
  }
}
