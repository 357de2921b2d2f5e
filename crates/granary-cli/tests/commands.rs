// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command plumbing against a real runtime.

use clap::Parser;
use granary_cli::{Cli, Commands, parse_job_configs, run};
use granary_core::JobState;
use granary_runtime::{Builder, JobRef, PackedValue, Runtime};
use tempfile::TempDir;

fn runtime(dir: &TempDir) -> Runtime {
    let mut rt = Runtime::open(dir.path().join("store.db")).unwrap();
    rt.register_builder(
        Builder::new("double", |ctx| {
            let x = ctx.config().as_int().unwrap_or(0);
            Ok(Some(PackedValue::pack(&(x * 2))?))
        })
        .unwrap(),
    );
    rt
}

fn command(args: &[&str]) -> Commands {
    Cli::try_parse_from(args).unwrap().command
}

#[tokio::test]
async fn compute_then_drop_round_trip() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);

    run(&rt, command(&["granary", "compute", "double", "[1, 2]"]))
        .await
        .unwrap();
    let job = JobRef::new("double", 1).unwrap();
    assert_eq!(rt.get_state(&job).unwrap(), JobState::Finished);
    assert_eq!(rt.read(&job).unwrap().value::<i64>().unwrap(), 2);

    run(&rt, command(&["granary", "drop", "double", "1"]))
        .await
        .unwrap();
    assert_eq!(rt.get_state(&job).unwrap(), JobState::Detached);
    assert_eq!(
        rt.get_state(&JobRef::new("double", 2).unwrap()).unwrap(),
        JobState::Finished
    );
}

#[tokio::test]
async fn free_and_archive_commands() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);

    run(&rt, command(&["granary", "compute", "double", "[1, 2]"]))
        .await
        .unwrap();

    run(&rt, command(&["granary", "free", "double", "1"]))
        .await
        .unwrap();
    assert_eq!(
        rt.get_state(&JobRef::new("double", 1).unwrap()).unwrap(),
        JobState::Freed
    );

    run(&rt, command(&["granary", "archive", "double", "2"]))
        .await
        .unwrap();
    assert_eq!(
        rt.get_state(&JobRef::new("double", 2).unwrap()).unwrap(),
        JobState::Detached
    );
}

#[tokio::test]
async fn drop_builder_command_clears_everything() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);

    run(&rt, command(&["granary", "compute", "double", "[1, 2, 3]"]))
        .await
        .unwrap();
    run(&rt, command(&["granary", "drop-builder", "double"]))
        .await
        .unwrap();
    for i in 1..=3 {
        assert_eq!(
            rt.get_state(&JobRef::new("double", i).unwrap()).unwrap(),
            JobState::Detached
        );
    }
}

#[tokio::test]
async fn compute_with_unknown_builder_fails() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let result = run(&rt, command(&["granary", "compute", "nope", "1"])).await;
    assert!(result.is_err());
}

#[test]
fn config_expansion_matches_key_derivation() {
    let jobs = parse_job_configs("double", r#"[{"x": 1}, {"x": 2}]"#).unwrap();
    let direct = JobRef::new(
        "double",
        [("x", 1i64)].into_iter().collect::<granary_core::ConfigValue>(),
    )
    .unwrap();
    assert_eq!(jobs[0].key(), direct.key());
}
