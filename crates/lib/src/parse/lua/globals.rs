//! Globals visible to Lua build files.
//!
//! - `target{...}` - Declare a target; returns its relative label `":name"`
//! - `package_name()` - Path of the package being parsed
//!
//! `target{}` accepts `name`, `deps`, `outs`, `cmd`, and the optional hook
//! functions `pre_build(ctx)` and `post_build(ctx, output)`.

use std::sync::{Arc, Mutex};

use mlua::prelude::*;

use super::hooks::LuaHook;
use crate::target::{HookKind, TargetSpec};
use crate::util::sync::lock;

/// Targets declared while evaluating one build file.
pub type Declared = Arc<Mutex<Vec<TargetSpec>>>;

/// Register the build file globals for `package`.
pub fn register_globals(lua: &Lua, package: &str, declared: Declared) -> LuaResult<()> {
  let globals = lua.globals();

  let target_fn = lua.create_function(move |lua, table: LuaTable| {
    let spec = spec_from_table(lua, &table)?;
    let label = format!(":{}", spec.name);
    lock(&declared).push(spec);
    Ok(label)
  })?;
  globals.set("target", target_fn)?;

  let package = package.to_string();
  let package_name = lua.create_function(move |_, ()| Ok(package.clone()))?;
  globals.set("package_name", package_name)?;

  Ok(())
}

/// Convert a `target{}`-style table into a spec. Hook functions stay bound
/// to the VM that declared them.
pub fn spec_from_table(lua: &Lua, table: &LuaTable) -> LuaResult<TargetSpec> {
  let name: Option<String> = table.get("name")?;
  let name = name.ok_or_else(|| LuaError::external("target requires a 'name' field"))?;

  let deps: Option<Vec<String>> = table.get("deps")?;
  let outs: Option<Vec<String>> = table.get("outs")?;
  let cmd: Option<String> = table.get("cmd")?;
  let pre_build: Option<LuaFunction> = table.get("pre_build")?;
  let post_build: Option<LuaFunction> = table.get("post_build")?;

  let mut spec = TargetSpec::new(&name)
    .with_deps(deps.unwrap_or_default())
    .with_outs(outs.unwrap_or_default());
  spec.cmd = cmd;
  spec.pre_build = pre_build.map(|f| LuaHook::new(lua, f, HookKind::PreBuild));
  spec.post_build = post_build.map(|f| LuaHook::new(lua, f, HookKind::PostBuild));
  Ok(spec)
}
