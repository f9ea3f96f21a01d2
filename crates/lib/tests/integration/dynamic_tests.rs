//! Hooks that extend the graph while the build runs.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kiln_lib::build::build;
use kiln_lib::config::{Config, Engine};
use kiln_lib::graph::rescan_deps;
use kiln_lib::package::{CallbackOutcome, Package, PackageEditor};
use kiln_lib::parse::{ParseError, Parser, run_build_function};
use kiln_lib::state::{BuildState, BuildStatus, PendingTask};
use kiln_lib::target::{BuildHook, BuildTarget, HookError, HookKind, TargetSpec, TargetState};

use super::common::{Canned, TestRepo, l, parse, run, sorted};

const FOO_H: &str = r#"
target{ name = "a" }
target{
  name = "b",
  deps = { ":a" },
  post_build = function(ctx, output)
    for file in output:gmatch("%S+") do
      ctx:add_out(file)
    end
    ctx:add_target{ name = "c", deps = { "foo.h" } }
  end,
}
"#;

mod post_build {
  use super::*;

  #[tokio::test]
  async fn generated_header_adds_target() {
    let repo = TestRepo::new(&[("p/BUILD.lua", FOO_H)]);
    let state = repo.state();
    let runner = Arc::new(Canned::new().output("//p:b", "foo.h foo.cc"));

    let summary = run(&state, &runner, &["//p:b"]).await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(summary.built, vec![l("//p:a"), l("//p:b"), l("//p:c")]);

    let c = state.graph().target(&l("//p:c")).unwrap();
    assert_eq!(c.deps(), vec![l("//p:b")]);
    assert!(state.graph().has_edge(&l("//p:c"), &l("//p:b")));
    assert_eq!(state.graph().build_order(), vec![l("//p:a"), l("//p:b"), l("//p:c")]);

    let b = state.graph().target(&l("//p:b")).unwrap();
    assert_eq!(b.outs(), vec!["foo.h", "foo.cc"]);
    assert_eq!(b.output().as_deref(), Some("foo.h foo.cc"));
  }

  #[tokio::test]
  async fn cycle_fails_mutating_target_only() {
    let repo = TestRepo::new(&[(
      "p/BUILD.lua",
      r#"
      target{ name = "a" }
      target{
        name = "b",
        deps = { ":a" },
        post_build = function(ctx, output)
          ctx:add_dep_to("a", ":b")
        end,
      }
      target{ name = "other" }
      "#,
    )]);
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let summary = run(&state, &runner, &["//p:b", "//p:other"]).await.unwrap();

    assert_eq!(summary.failed, vec![l("//p:b")]);
    assert_eq!(sorted(summary.built), vec![l("//p:a"), l("//p:other")]);

    let a = state.graph().target(&l("//p:a")).unwrap();
    assert_eq!(a.state(), TargetState::Done);
    assert!(a.deps().is_empty());
    assert!(!state.graph().has_edge(&l("//p:a"), &l("//p:b")));

    let failure = state.events_for(&l("//p:b")).pop().unwrap();
    assert_eq!(failure.status, BuildStatus::TargetBuildFailed);
    assert!(failure.error.unwrap().contains("dynamic dependency cycle"));
  }

  #[tokio::test]
  async fn raising_hook_skips_dependents() {
    let repo = TestRepo::new(&[(
      "p/BUILD.lua",
      r#"
      target{ name = "gen", post_build = function(ctx, output) error("unexpected output") end }
      target{ name = "use", deps = { ":gen" } }
      "#,
    )]);
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let summary = run(&state, &runner, &["//p:use"]).await.unwrap();

    assert_eq!(summary.failed, vec![l("//p:gen")]);
    assert_eq!(summary.skipped, vec![l("//p:use")]);
    assert_eq!(runner.ran(), vec![l("//p:gen")]);
  }
}

mod rescan {
  use super::*;

  #[test]
  fn repeated_rescan_adds_nothing() {
    let repo = TestRepo::new(&[("p/BUILD.lua", FOO_H)]);
    let state = repo.state();
    let pkg = parse(&state, "p");
    let b = pkg.target("b").unwrap();

    state.parser().run_post_build_function(1, &state, &b, "foo.h foo.cc").unwrap();
    let edges = state.graph().edge_count();
    state.drain_tasks();

    let outcome = CallbackOutcome {
      new_edges: vec![(l("//p:c"), l("//p:b"))],
      ..Default::default()
    };
    let first = rescan_deps(1, &state, &b, &outcome).unwrap();
    let second = rescan_deps(1, &state, &b, &outcome).unwrap();

    assert_eq!(first, second);
    assert_eq!(state.graph().edge_count(), edges);
    assert!(state.deferred().is_empty());
    assert!(
      state
        .drain_tasks()
        .iter()
        .all(|task| matches!(task, PendingTask::Activate { .. }))
    );
  }
}

mod serialization {
  use super::*;

  /// Tracks how many hooks are inside a package gate at once.
  #[derive(Debug, Default)]
  struct Gauge {
    in_flight: AtomicUsize,
    max: AtomicUsize,
    calls: AtomicUsize,
  }

  #[derive(Debug)]
  struct GaugedHook(Arc<Gauge>);

  impl BuildHook for GaugedHook {
    fn call(&self, target: &BuildTarget, _output: Option<&str>, editor: &mut PackageEditor<'_>) -> Result<(), HookError> {
      let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.0.max.fetch_max(now, Ordering::SeqCst);
      std::thread::sleep(Duration::from_millis(5));
      editor.add_target(TargetSpec::new(&format!("{}_gen", target.label().name())).with_deps([":seed"]));
      self.0.calls.fetch_add(1, Ordering::SeqCst);
      self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    }
  }

  /// Declares `seed` plus `targets` siblings that all carry a gauged
  /// post-build hook.
  #[derive(Debug)]
  struct GaugedEngine {
    gauge: Arc<Gauge>,
    targets: usize,
  }

  impl Parser for GaugedEngine {
    fn engine(&self) -> Engine {
      Engine::Lua
    }

    fn parse_file(&self, _state: &BuildState, package: &Package, _filename: &Path) -> Result<(), ParseError> {
      let mut specs = vec![TargetSpec::new("seed")];
      for i in 0..self.targets {
        specs.push(TargetSpec::new(&format!("t{i}")).with_post_build(Arc::new(GaugedHook(Arc::clone(&self.gauge)))));
      }
      package.populate(specs)?;
      Ok(())
    }

    fn run_pre_build_function(&self, tid: usize, state: &BuildState, target: &BuildTarget) -> Result<(), ParseError> {
      run_build_function(tid, state, target, HookKind::PreBuild, None)
    }

    fn run_post_build_function(
      &self,
      tid: usize,
      state: &BuildState,
      target: &BuildTarget,
      output: &str,
    ) -> Result<(), ParseError> {
      run_build_function(tid, state, target, HookKind::PostBuild, Some(output))
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn hooks_in_one_package_never_overlap() {
    let repo = TestRepo::new(&[("p/BUILD.lua", "")]);
    let gauge = Arc::new(Gauge::default());
    let mut config = Config::default();
    config.build.parallelism = 8;
    let engine = GaugedEngine {
      gauge: Arc::clone(&gauge),
      targets: 8,
    };
    let state = Arc::new(BuildState::with_parser(repo.path(), config, Box::new(engine)));

    let summary = build(Arc::clone(&state), Arc::new(Canned::new()), &[l("//p:all")])
      .await
      .unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 8);
    assert_eq!(gauge.max.load(Ordering::SeqCst), 1);
    // seed, eight hooked targets and the eight targets they added
    assert_eq!(summary.built.len(), 17);
    assert_eq!(state.graph().package("p").unwrap().len(), 17);
  }
}
