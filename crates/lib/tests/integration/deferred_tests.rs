//! Packages waiting on targets that a post-build hook has yet to create.

use std::sync::Arc;

use kiln_lib::deferred::Deferral;
use kiln_lib::graph::{DepStatus, resolve_package};
use kiln_lib::graph::rescan::ensure_available;
use kiln_lib::parse::{resume_parse, undefer_any_parses};
use kiln_lib::state::{BuildStatus, PendingTask};

use super::common::{Canned, TestRepo, l, parse, run, sorted};

/// Each package needs a target that only the other's hook creates.
fn mutual_repo() -> TestRepo {
  TestRepo::new(&[
    (
      "x/BUILD.lua",
      r#"
      target{ name = "x1", post_build = function(ctx, output) ctx:add_target{ name = "made_x" } end }
      target{ name = "use_y", deps = { "//y:made_y" } }
      "#,
    ),
    (
      "y/BUILD.lua",
      r#"
      target{ name = "y1", post_build = function(ctx, output) ctx:add_target{ name = "made_y" } end }
      target{ name = "use_x", deps = { "//x:made_x" } }
      "#,
    ),
  ])
}

mod coordinator {
  use super::*;

  #[test]
  fn only_keyed_entries_resume() {
    let repo = mutual_repo();
    let state = repo.state();

    let x = parse(&state, "x");
    let y = parse(&state, "y");
    // x was parsed before y existed; resolving it again now defers it too.
    assert!(!resolve_package(0, &state, &x).unwrap());

    assert_eq!(
      state.deferred().entries(),
      vec![(l("//x:x1"), "y".to_string()), (l("//y:y1"), "x".to_string())]
    );
    let deferred = state.events_for(&l("//x:all")).pop().unwrap();
    assert_eq!(deferred.status, BuildStatus::ParseDeferred);
    state.drain_tasks();

    let y1 = y.target("y1").unwrap();
    state.parser().run_post_build_function(1, &state, &y1, "").unwrap();
    assert_eq!(undefer_any_parses(&state, &y1), 1);

    let resumes: Vec<_> = state
      .drain_tasks()
      .into_iter()
      .filter(|task| matches!(task, PendingTask::ResumeParse { .. }))
      .collect();
    assert_eq!(
      resumes,
      vec![PendingTask::ResumeParse {
        package: "x".to_string(),
        unblocked_by: l("//y:y1"),
      }]
    );
    assert!(state.deferred().is_blocked("y"), "unrelated entry stays blocked");

    resume_parse(2, &state, &x, &l("//y:y1")).unwrap();
    assert!(!state.deferred().is_blocked("x"));
    assert_eq!(state.deferred().len(), 1);

    // Draining again resumes nothing.
    assert_eq!(undefer_any_parses(&state, &y1), 0);
  }

  #[test]
  fn deferral_after_release_proceeds() {
    let repo = mutual_repo();
    let state = repo.state();
    let _x = parse(&state, "x");
    let y = parse(&state, "y");

    let y1 = y.target("y1").unwrap();
    state.parser().run_post_build_function(1, &state, &y1, "").unwrap();
    undefer_any_parses(&state, &y1);

    // Anyone who asks now observes the finished hook instead of waiting.
    assert_eq!(state.deferred().defer("late", &l("//y:y1")), Deferral::Proceed);
    assert!(!state.deferred().is_blocked("late"));

    let status = ensure_available(0, &state, &l("//late:t"), &l("//y:made_y")).unwrap();
    assert_eq!(status, DepStatus::Pending);

    let err = ensure_available(0, &state, &l("//late:t"), &l("//y:never")).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
  }
}

mod scheduled {
  use super::*;

  #[tokio::test]
  async fn mutual_deferrals_complete() {
    let repo = mutual_repo();
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let summary = run(&state, &runner, &["//x:use_y", "//y:use_x"]).await.unwrap();

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(
      sorted(summary.built),
      vec![
        l("//x:made_x"),
        l("//x:use_y"),
        l("//x:x1"),
        l("//y:made_y"),
        l("//y:use_x"),
        l("//y:y1"),
      ]
    );
    assert!(state.deferred().is_empty());
  }

  #[tokio::test]
  async fn hook_that_never_adds_target_fails_dependent() {
    let repo = TestRepo::new(&[
      ("gen/BUILD.lua", r#"target{ name = "g", post_build = function(ctx, output) end }"#),
      ("app/BUILD.lua", r#"target{ name = "bin", deps = { "//gen:missing" } }"#),
    ]);
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let summary = run(&state, &runner, &["//app:bin"]).await.unwrap();

    assert_eq!(summary.failed, vec![l("//app:bin")]);
    assert!(summary.built.contains(&l("//gen:g")));
    let failure = state.events_for(&l("//app:bin")).pop().unwrap();
    assert_eq!(failure.status, BuildStatus::TargetBuildFailed);
    assert!(failure.error.unwrap().contains("//gen:missing"));
  }

  #[tokio::test]
  async fn failed_package_skips_dependents() {
    let repo = TestRepo::new(&[
      ("broken/BUILD.lua", "this is not lua"),
      ("app/BUILD.lua", r#"target{ name = "bin", deps = { "//broken:lib" } }"#),
    ]);
    let state = repo.state();
    let runner = Arc::new(Canned::new());

    let summary = run(&state, &runner, &["//app:bin"]).await.unwrap();

    assert!(!summary.is_success());
    assert!(runner.ran().is_empty());
    let parse_failure = state.events_for(&l("//broken:all")).pop().unwrap();
    assert_eq!(parse_failure.status, BuildStatus::ParseFailed);
  }
}
