//! Environment naming, reclaim and image handling across runs.

use crate::common::{IMAGE, executor, executor_with, provider, read_env_file, task};
use buildvault::testing::{InMemoryProvider, Operation, ProviderCall};
use buildvault::{Artifact, EnvironmentState, ExecutorConfig, Fingerprint};
use std::sync::Arc;

#[tokio::test]
async fn test_same_name_fresh_state_each_run() {
    let provider = provider();
    let t = task("counter").command("echo run >> /tmp/runs").build();

    let first = executor(&provider).execute(&t).await.unwrap();
    let second = executor(&provider).execute(&t).await.unwrap();

    let first_result = first.get(&t).unwrap();
    let second_result = second.get(&t).unwrap();
    assert_eq!(first_result.environment_name, second_result.environment_name);
    assert_ne!(first_result.environment_id, second_result.environment_id);
    assert_ne!(first.run_id, second.run_id);

    // Rebuilt from scratch: the first run's file is gone.
    assert_eq!(read_env_file(&provider, &second, &t, "/tmp/runs"), "run\n");
    assert_eq!(provider.environment_names().len(), 1);
    assert!(provider.calls().contains(&ProviderCall::RemoveEnvironment(
        first_result.environment_name.clone()
    )));
}

#[tokio::test]
async fn test_running_leftover_is_stopped_then_removed() {
    let provider = provider();
    let t = task("t").command("true").build();
    let name = executor(&provider).environment_name(&t);
    let stale = provider.seed_environment(&name, IMAGE, EnvironmentState::Running);

    let report = executor(&provider).execute(&t).await.unwrap();

    assert!(provider.environment_state(&stale).is_none());
    assert_ne!(report.environment_id(&t), Some(&stale));

    let calls = provider.calls();
    let stop = calls
        .iter()
        .position(|c| matches!(c, ProviderCall::StopEnvironment { .. }))
        .unwrap();
    let remove = calls
        .iter()
        .position(|c| matches!(c, ProviderCall::RemoveEnvironment(_)))
        .unwrap();
    let create = calls
        .iter()
        .position(|c| matches!(c, ProviderCall::CreateEnvironment { .. }))
        .unwrap();
    assert!(stop < remove && remove < create);
}

#[tokio::test]
async fn test_stop_failure_during_reclaim_is_ignored() {
    let provider = provider();
    let t = task("t").command("true").build();
    let name = executor(&provider).environment_name(&t);
    provider.seed_environment(&name, IMAGE, EnvironmentState::Running);
    provider.fail_next(Operation::StopEnvironment);

    // The remove then fails too (still running) and the create conflicts.
    let err = executor(&provider).execute(&t).await.unwrap_err();

    assert!(err.to_string().contains("failed to create environment"));
    assert_eq!(provider.call_count(Operation::RemoveEnvironment), 1);
}

#[tokio::test]
async fn test_pull_skipped_when_image_present() {
    let provider = Arc::new(InMemoryProvider::new().with_image(IMAGE));
    let t = task("t").command("true").build();

    executor(&provider).execute(&t).await.unwrap();

    assert_eq!(provider.call_count(Operation::ImageExists), 1);
    assert_eq!(provider.call_count(Operation::PullImage), 0);
}

#[tokio::test]
async fn test_pull_happens_once_per_missing_image() {
    let provider = provider();
    let t = task("t").command("true").build();

    executor(&provider).execute(&t).await.unwrap();
    executor(&provider).execute(&t).await.unwrap();

    assert_eq!(provider.call_count(Operation::PullImage), 1);
}

#[tokio::test]
async fn test_environment_name_format() {
    let provider = provider();
    let t = task("build").command("true").build();
    let config = ExecutorConfig::default().with_prefix("ci");

    let report = executor_with(&provider, config).execute(&t).await.unwrap();

    let result = report.get(&t).unwrap();
    assert_eq!(result.environment_name, format!("ci_build_{}", Fingerprint::of(&t)));
    assert_eq!(result.fingerprint, Fingerprint::of(&t));
}

// Downstream names ignore upstream commands. A changed upstream reuses the
// downstream name; runs stay correct because every run rebuilds.
#[tokio::test]
async fn test_upstream_command_change_keeps_downstream_name() {
    let provider = provider();
    let build = |upstream_command: &str| {
        let upstream = task("gen")
            .command("mkdir -p /out")
            .command(upstream_command.to_string())
            .build();
        task("use")
            .depends_on(upstream, [Artifact::same_path("/out/v.txt")])
            .command("cat /out/v.txt")
            .build()
    };
    let old = build("echo old > /out/v.txt");
    let new = build("echo new > /out/v.txt");

    let first = executor(&provider).execute(&old).await.unwrap();
    let second = executor(&provider).execute(&new).await.unwrap();

    assert_eq!(
        first.get(&old).unwrap().environment_name,
        second.get(&new).unwrap().environment_name
    );
    assert_eq!(read_env_file(&provider, &second, &new, "/out/v.txt"), "new\n");
}
