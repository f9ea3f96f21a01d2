//! The legacy build script engine.
//!
//! A line-oriented format kept for older repositories:
//!
//! ```text
//! # comments start with '#'
//! set CC = cc
//!
//! target lib
//!   outs lib.o
//!   cmd ${CC} -c lib.c
//! end
//!
//! target app
//!   deps :lib lib.o //third_party/zlib
//!   cmd $CC -o app lib.o
//! end
//! ```
//!
//! `$NAME` and `${NAME}` expand variables set earlier in the file or in a
//! preload, `$$` is a literal `$`. Preload scripts may only set variables and
//! are evaluated once, the first time any build file is parsed. Hook lines
//! are accepted but cannot be run by this engine.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::{ParseError, Parser, hook_not_implemented};
use crate::config::{ConfigError, Engine};
use crate::package::Package;
use crate::state::BuildState;
use crate::target::{BuildTarget, DeclaredHook, HookKind, TargetSpec};

type Vars = HashMap<String, String>;

/// Failure while evaluating a preload, kept so every parse reports it.
#[derive(Debug, Clone)]
struct PreloadFailure {
  path: PathBuf,
  message: String,
}

#[derive(Debug)]
pub struct ScriptParser {
  root: PathBuf,
  preload_paths: Vec<PathBuf>,
  preloaded: OnceLock<Result<Vars, PreloadFailure>>,
}

impl ScriptParser {
  /// Preloads are not touched until the first parse.
  pub fn new(root: &Path, preload_build_defs: &[PathBuf]) -> Self {
    Self {
      root: root.to_path_buf(),
      preload_paths: preload_build_defs.to_vec(),
      preloaded: OnceLock::new(),
    }
  }

  fn preloaded_vars(&self) -> Result<&Vars, ParseError> {
    let preloaded = self.preloaded.get_or_init(|| {
      let mut vars = Vars::new();
      for preload in &self.preload_paths {
        let path = self.root.join(preload);
        debug!(path = %path.display(), "evaluating preload script");
        let source = fs::read_to_string(&path).map_err(|e| PreloadFailure {
          path: path.clone(),
          message: e.to_string(),
        })?;
        let specs = interpret(&source, &path, &mut vars).map_err(|e| PreloadFailure {
          path: path.clone(),
          message: e.to_string(),
        })?;
        if !specs.is_empty() {
          return Err(PreloadFailure {
            path,
            message: "preload scripts may only set variables".to_string(),
          });
        }
      }
      Ok(vars)
    });

    preloaded.as_ref().map_err(|failure| {
      ParseError::Config(ConfigError::InvalidPreload {
        path: failure.path.clone(),
        message: failure.message.clone(),
      })
    })
  }
}

impl Parser for ScriptParser {
  fn engine(&self) -> Engine {
    Engine::Script
  }

  fn parse_file(&self, _state: &BuildState, package: &Package, filename: &Path) -> Result<(), ParseError> {
    let mut vars = self.preloaded_vars()?.clone();
    let source = fs::read_to_string(filename).map_err(|source| ParseError::Io {
      path: filename.to_path_buf(),
      source,
    })?;
    let specs = interpret(&source, filename, &mut vars)?;
    package.populate(specs)?;
    Ok(())
  }

  fn run_pre_build_function(&self, tid: usize, state: &BuildState, target: &BuildTarget) -> Result<(), ParseError> {
    Err(hook_not_implemented(tid, state, target, HookKind::PreBuild))
  }

  fn run_post_build_function(
    &self,
    tid: usize,
    state: &BuildState,
    target: &BuildTarget,
    _output: &str,
  ) -> Result<(), ParseError> {
    Err(hook_not_implemented(tid, state, target, HookKind::PostBuild))
  }
}

/// Evaluate a script, updating `vars` and returning the declared targets.
fn interpret(source: &str, path: &Path, vars: &mut Vars) -> Result<Vec<TargetSpec>, ParseError> {
  let syntax = |line: usize, message: String| ParseError::Syntax {
    path: path.to_path_buf(),
    line,
    message,
  };

  let mut specs = Vec::new();
  let mut current: Option<(usize, TargetSpec)> = None;

  for (idx, raw) in source.lines().enumerate() {
    let line_no = idx + 1;
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }

    let (keyword, rest) = match line.split_once(char::is_whitespace) {
      Some((keyword, rest)) => (keyword, rest.trim()),
      None => (line, ""),
    };

    if keyword == "end" {
      match current.take() {
        Some((_, spec)) => specs.push(spec),
        None => return Err(syntax(line_no, "'end' without 'target'".to_string())),
      }
      continue;
    }

    match (keyword, current.as_mut()) {
      ("set", None) => {
        let (name, value) = rest
          .split_once('=')
          .ok_or_else(|| syntax(line_no, "expected 'set NAME = value'".to_string()))?;
        let name = name.trim();
        if !is_var_name(name) {
          return Err(syntax(line_no, format!("invalid variable name '{name}'")));
        }
        let value = expand(value.trim(), vars).map_err(|m| syntax(line_no, m))?;
        vars.insert(name.to_string(), value);
      }
      ("target", None) => {
        if rest.is_empty() || rest.contains(char::is_whitespace) {
          return Err(syntax(line_no, "expected 'target NAME'".to_string()));
        }
        let name = expand(rest, vars).map_err(|m| syntax(line_no, m))?;
        current = Some((line_no, TargetSpec::new(&name)));
      }
      ("deps", Some((_, spec))) => {
        let value = expand(rest, vars).map_err(|m| syntax(line_no, m))?;
        spec.deps.extend(value.split_whitespace().map(str::to_string));
      }
      ("outs", Some((_, spec))) => {
        let value = expand(rest, vars).map_err(|m| syntax(line_no, m))?;
        spec.outs.extend(value.split_whitespace().map(str::to_string));
      }
      ("cmd", Some((_, spec))) => {
        spec.cmd = Some(expand(rest, vars).map_err(|m| syntax(line_no, m))?);
      }
      ("pre_build", Some((_, spec))) => {
        spec.pre_build = Some(Arc::new(DeclaredHook::new(rest)));
      }
      ("post_build", Some((_, spec))) => {
        spec.post_build = Some(Arc::new(DeclaredHook::new(rest)));
      }
      ("target", Some((start, _))) => {
        return Err(syntax(line_no, format!("nested target (block opened on line {start})")));
      }
      ("set", Some(_)) => {
        return Err(syntax(line_no, "'set' is not allowed inside a target".to_string()));
      }
      (other, _) => return Err(syntax(line_no, format!("unknown directive '{other}'"))),
    }
  }

  if let Some((start, spec)) = current {
    return Err(syntax(start, format!("target '{}' is missing 'end'", spec.name)));
  }
  Ok(specs)
}

fn is_var_name(name: &str) -> bool {
  !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand `$NAME`, `${NAME}` and `$$`.
fn expand(input: &str, vars: &Vars) -> Result<String, String> {
  let mut out = String::with_capacity(input.len());
  let mut chars = input.chars().peekable();

  while let Some(ch) = chars.next() {
    if ch != '$' {
      out.push(ch);
      continue;
    }

    let name = match chars.peek() {
      Some('$') => {
        chars.next();
        out.push('$');
        continue;
      }
      Some('{') => {
        chars.next();
        let mut name = String::new();
        loop {
          match chars.next() {
            Some('}') => break,
            Some(c) => name.push(c),
            None => return Err("unterminated '${'".to_string()),
          }
        }
        name
      }
      _ => {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
          if !(c.is_ascii_alphanumeric() || c == '_') {
            break;
          }
          name.push(c);
          chars.next();
        }
        name
      }
    };

    if name.is_empty() {
      return Err("'$' must be followed by a variable name".to_string());
    }
    let value = vars
      .get(&name)
      .ok_or_else(|| format!("undefined variable '{name}'"))?;
    out.push_str(value);
  }

  Ok(out)
}
