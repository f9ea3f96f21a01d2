//! Behaviour that differs between the parser engines.

use std::sync::Arc;

use kiln_lib::build::{BuildError, ShellRunner, build};
use kiln_lib::config::Engine;
use kiln_lib::parse::ParseError;
use kiln_lib::state::BuildState;

use super::common::{Canned, TestRepo, l, parse, run};

mod unsupported_hooks {
  use super::*;

  #[tokio::test]
  async fn toml_pre_build_is_fatal() {
    let repo = TestRepo::new(&[
      (".kiln.toml", "[parse]\nengine = \"toml\"\n"),
      (
        "p/BUILD.toml",
        r#"
[[target]]
name = "dep"

[[target]]
name = "a"
deps = [":dep"]
pre_build = "prepare"
"#,
      ),
    ]);
    let state = repo.state();
    assert_eq!(state.engine(), Engine::Toml);
    let runner = Arc::new(Canned::new());

    let err = run(&state, &runner, &["//p:a"]).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, BuildError::Parse(ParseError::NotImplemented { .. })));
    assert_eq!(
      err.to_string(),
      "pre-build function not implemented by the toml engine (used by //p:a)"
    );
    // The action never ran.
    assert_eq!(runner.ran(), vec![l("//p:dep")]);
  }

  #[tokio::test]
  async fn script_post_build_is_fatal() {
    let repo = TestRepo::new(&[
      (".kiln.toml", "[parse]\nengine = \"script\"\n"),
      ("p/BUILD", "target a\n  cmd echo hi\n  post_build scan\nend\n"),
    ]);
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let err = run(&state, &runner, &["//p:a"]).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("not implemented by the script engine"));
  }

  #[test]
  fn unknown_engine_is_fatal_at_startup() {
    let repo = TestRepo::new(&[(".kiln.toml", "[parse]\nengine = \"make\"\n")]);
    let err = BuildState::new(repo.path(), repo.config()).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("make"));
  }
}

mod declarative {
  use super::*;

  #[tokio::test]
  async fn toml_builds_across_packages() {
    let repo = TestRepo::new(&[
      (".kiln.toml", "[parse]\nengine = \"toml\"\n"),
      ("lib/BUILD.toml", "[[target]]\nname = \"lib\"\nouts = [\"lib.a\"]\n"),
      ("app/BUILD.toml", "[[target]]\nname = \"app\"\ndeps = [\"//lib\"]\n"),
    ]);
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let summary = run(&state, &runner, &["//app:app"]).await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(summary.built, vec![l("//lib:lib"), l("//app:app")]);
  }

  #[test]
  fn script_preloads_supply_variables() {
    let repo = TestRepo::new(&[
      (
        ".kiln.toml",
        "[parse]\nengine = \"script\"\npreload_build_defs = [\"defs/toolchain\"]\n",
      ),
      ("defs/toolchain", "set CC = clang\n"),
      ("p/BUILD", "target obj\n  cmd $CC -c x.c\nend\n"),
    ]);
    let state = repo.state();
    let pkg = parse(&state, "p");
    assert_eq!(pkg.target("obj").unwrap().cmd(), Some("clang -c x.c"));
  }
}

#[cfg(unix)]
mod shell {
  use super::*;

  #[tokio::test]
  async fn lua_hooks_see_real_command_output() {
    let repo = TestRepo::new(&[(
      "p/BUILD.lua",
      r#"
      target{ name = "a", cmd = "true" }
      target{
        name = "b",
        deps = { ":a" },
        cmd = "echo foo.h foo.cc",
        post_build = function(ctx, output)
          for file in output:gmatch("%S+") do
            ctx:add_out(file)
          end
          ctx:add_target{ name = "c", deps = { "foo.h" }, cmd = "echo compiled" }
        end,
      }
      "#,
    )]);
    let state = repo.state();
    let runner = Arc::new(ShellRunner::new(state.config().build.shell.clone()));

    let summary = build(Arc::clone(&state), runner, &[l("//p:b")]).await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    let c = state.graph().target(&l("//p:c")).unwrap();
    assert_eq!(c.output().as_deref(), Some("compiled"));
  }
}
