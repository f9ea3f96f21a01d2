//! Build labels.
//!
//! A label identifies a single target as `//package/path:name`. Labels are the
//! only way targets refer to each other; every lookup goes back through the
//! build graph, so nothing holds a direct reference to another target's node.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Pseudo target name used when reporting against a whole package.
pub const PACKAGE_PSEUDO_TARGET: &str = "all";

/// Errors produced while parsing a label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
  #[error("empty label")]
  Empty,

  #[error("label '{0}' must start with '//' or ':'")]
  NotALabel(String),

  #[error("label '{0}' has an empty target name")]
  EmptyName(String),

  #[error("label '{label}' contains invalid character '{ch}'")]
  InvalidCharacter { label: String, ch: char },

  #[error("label '{0}' has an invalid package path")]
  InvalidPackage(String),
}

/// Identifier of a build target: package path plus target name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
  package: String,
  name: String,
}

impl Label {
  /// Create a label after validating both components.
  pub fn new(package: impl Into<String>, name: impl Into<String>) -> Result<Self, LabelError> {
    let package = package.into();
    let name = name.into();
    let label = Self { package, name };
    label.validate()?;
    Ok(label)
  }

  /// The `//pkg:all` label used to attribute package-level events.
  pub fn for_package(package: &str) -> Self {
    Self {
      package: package.to_string(),
      name: PACKAGE_PSEUDO_TARGET.to_string(),
    }
  }

  /// A sibling label in the same package. `name` must already be a valid
  /// target name (it comes from a registered target).
  pub fn with_name(&self, name: &str) -> Self {
    Self {
      package: self.package.clone(),
      name: name.to_string(),
    }
  }

  pub fn package(&self) -> &str {
    &self.package
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Parse a label that may be relative (`:name`) to `current_package`.
  pub fn parse_relative(s: &str, current_package: &str) -> Result<Self, LabelError> {
    let s = s.trim();
    if s.is_empty() {
      return Err(LabelError::Empty);
    }

    if let Some(name) = s.strip_prefix(':') {
      return Self::new(current_package, name).map_err(|e| relabel(e, s));
    }

    let Some(rest) = s.strip_prefix("//") else {
      return Err(LabelError::NotALabel(s.to_string()));
    };

    let (package, name) = match rest.split_once(':') {
      Some((package, name)) => (package, name.to_string()),
      // `//foo/bar` is shorthand for `//foo/bar:bar`
      None => {
        let last = rest.rsplit('/').next().unwrap_or_default();
        (rest, last.to_string())
      }
    };

    Self::new(package, name).map_err(|e| relabel(e, s))
  }

  /// Whether a dependency string is written as a label rather than an output file.
  pub fn looks_like_label(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("//") || s.starts_with(':')
  }

  fn validate(&self) -> Result<(), LabelError> {
    if self.name.is_empty() {
      return Err(LabelError::EmptyName(self.to_string()));
    }

    for ch in self.name.chars() {
      if !is_name_char(ch) {
        return Err(LabelError::InvalidCharacter {
          label: self.to_string(),
          ch,
        });
      }
    }

    if !self.package.is_empty() {
      if self.package.starts_with('/') || self.package.ends_with('/') {
        return Err(LabelError::InvalidPackage(self.to_string()));
      }
      for segment in self.package.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
          return Err(LabelError::InvalidPackage(self.to_string()));
        }
        if let Some(ch) = segment.chars().find(|c| !is_package_char(*c)) {
          return Err(LabelError::InvalidCharacter {
            label: self.to_string(),
            ch,
          });
        }
      }
    }

    Ok(())
  }
}

/// Replace the label text in an error with what the user actually wrote.
fn relabel(err: LabelError, original: &str) -> LabelError {
  match err {
    LabelError::EmptyName(_) => LabelError::EmptyName(original.to_string()),
    LabelError::InvalidPackage(_) => LabelError::InvalidPackage(original.to_string()),
    LabelError::InvalidCharacter { ch, .. } => LabelError::InvalidCharacter {
      label: original.to_string(),
      ch,
    },
    other => other,
  }
}

fn is_name_char(ch: char) -> bool {
  ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+' | '#' | '@' | '=' | ',')
}

fn is_package_char(ch: char) -> bool {
  ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+' | '@')
}

impl fmt::Display for Label {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "//{}:{}", self.package, self.name)
  }
}

impl FromStr for Label {
  type Err = LabelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.trim_start().starts_with(':') {
      return Err(LabelError::NotALabel(s.to_string()));
    }
    Self::parse_relative(s, "")
  }
}

impl Serialize for Label {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Label {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}
