//! Lua hook functions and the `ctx` they receive.
//!
//! A hook is called as `pre_build(ctx)` or `post_build(ctx, output)`. `ctx`
//! describes the target and collects edits:
//!
//! - `ctx.name`, `ctx.label`, `ctx.package`, `ctx.outs`
//! - `ctx:add_dep(dep)` / `ctx:add_dep_to(target, dep)`
//! - `ctx:add_out(file)`
//! - `ctx:add_target{...}` - same fields as `target{}`
//!
//! The edits are handed to the package editor after the function returns.

use std::fmt;

use mlua::prelude::*;

use super::globals::spec_from_table;
use crate::package::{GraphEdit, PackageEditor};
use crate::target::{BuildHook, BuildTarget, Hook, HookError, HookKind};

/// Context passed to a Lua hook.
#[derive(Debug)]
pub struct HookCtx {
  name: String,
  label: String,
  package: String,
  outs: Vec<String>,
  edits: Vec<GraphEdit>,
}

impl HookCtx {
  pub fn new(target: &BuildTarget) -> Self {
    Self {
      name: target.label().name().to_string(),
      label: target.label().to_string(),
      package: target.label().package().to_string(),
      outs: target.outs(),
      edits: Vec::new(),
    }
  }

  pub fn into_edits(self) -> Vec<GraphEdit> {
    self.edits
  }
}

impl LuaUserData for HookCtx {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("name", |_, this| Ok(this.name.clone()));
    fields.add_field_method_get("label", |_, this| Ok(this.label.clone()));
    fields.add_field_method_get("package", |_, this| Ok(this.package.clone()));
    fields.add_field_method_get("outs", |_, this| Ok(this.outs.clone()));
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method_mut("add_dep", |_, this, dep: String| {
      this.edits.push(GraphEdit::AddDep {
        target: this.name.clone(),
        dep,
      });
      Ok(())
    });

    methods.add_method_mut("add_dep_to", |_, this, (target, dep): (String, String)| {
      this.edits.push(GraphEdit::AddDep { target, dep });
      Ok(())
    });

    methods.add_method_mut("add_out", |_, this, out: String| {
      this.outs.push(out.clone());
      this.edits.push(GraphEdit::AddOut {
        target: this.name.clone(),
        out,
      });
      Ok(())
    });

    methods.add_method_mut("add_target", |lua, this, table: LuaTable| {
      let spec = spec_from_table(lua, &table)?;
      let label = format!(":{}", spec.name);
      this.edits.push(GraphEdit::AddTarget(spec));
      Ok(label)
    });
  }
}

/// A Lua function bound to a target as a hook.
pub struct LuaHook {
  // Keeps the package's VM alive as long as the hook is reachable.
  lua: Lua,
  func: LuaFunction,
  kind: HookKind,
}

impl LuaHook {
  pub fn new(lua: &Lua, func: LuaFunction, kind: HookKind) -> Hook {
    std::sync::Arc::new(Self {
      lua: lua.clone(),
      func,
      kind,
    })
  }
}

impl fmt::Debug for LuaHook {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LuaHook").field("kind", &self.kind).finish_non_exhaustive()
  }
}

impl BuildHook for LuaHook {
  fn call(&self, target: &BuildTarget, output: Option<&str>, editor: &mut PackageEditor<'_>) -> Result<(), HookError> {
    let ctx_userdata = self.lua.create_userdata(HookCtx::new(target))?;

    let result = match self.kind {
      HookKind::PreBuild => self.func.call::<()>(&ctx_userdata),
      HookKind::PostBuild => self.func.call::<()>((&ctx_userdata, output.unwrap_or_default())),
    };

    // Take the context back even on failure so staged hooks do not keep
    // the VM alive from inside its own heap.
    let ctx: HookCtx = ctx_userdata.take()?;
    result?;
    for edit in ctx.into_edits() {
      editor.apply(edit);
    }
    Ok(())
  }
}
