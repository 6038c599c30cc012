//! Failure handling tests.
//!
//! The first unrecovered error aborts the run, carries the name of the task
//! (and command or path) that caused it, and nothing downstream runs.

use crate::common::{executor, provider, task};
use buildvault::testing::{InMemoryProvider, Operation};
use buildvault::{Artifact, EnvironmentState, ProvisionStage, TaskError};
use std::sync::Arc;

#[tokio::test]
async fn test_commands_run_in_order_and_stop_at_failure() {
    let provider = provider();
    let t = task("ordered")
        .command("echo c1 >> /tmp/log")
        .command("echo c2 >> /tmp/log && exit 1")
        .command("echo c3 >> /tmp/log")
        .build();

    let err = executor(&provider).execute(&t).await.unwrap_err();

    match &err {
        TaskError::Command {
            task,
            command,
            exit_code,
        } => {
            assert_eq!(task, "ordered");
            assert_eq!(command, "echo c2 >> /tmp/log && exit 1");
            assert_eq!(*exit_code, 1);
        }
        other => panic!("Expected Command error, got {:?}", other),
    }
    assert_eq!(
        err.to_string(),
        "task 'ordered': command 'echo c2 >> /tmp/log && exit 1' exited with code 1"
    );

    let name = executor(&provider).environment_name(&t);
    assert_eq!(
        provider.read_file_named(&name, "/tmp/log").unwrap(),
        b"c1\nc2\n"
    );
    let commands: Vec<String> = provider.commands().into_iter().map(|(_, c)| c).collect();
    assert_eq!(commands.len(), 2);
}

#[tokio::test]
async fn test_upstream_failure_aborts_downstream() {
    let provider = provider();
    let broken = task("broken").command("exit 42").build();
    let middle = task("middle")
        .depends_on(broken, [Artifact::same_path("/out/lib")])
        .command("echo middle")
        .build();
    let top = task("top").depends_on(middle, []).command("echo top").build();

    let err = executor(&provider).execute(&top).await.unwrap_err();

    match &err {
        TaskError::Dependency {
            task, dependency, source,
        } => {
            assert_eq!(task, "top");
            assert_eq!(dependency, "middle");
            assert!(matches!(
                source.as_ref(),
                TaskError::Dependency { dependency, .. } if dependency == "broken"
            ));
        }
        other => panic!("Expected Dependency error, got {:?}", other),
    }
    assert!(matches!(
        err.root_cause(),
        TaskError::Command { task, exit_code: 42, .. } if task == "broken"
    ));

    let commands: Vec<String> = provider.commands().into_iter().map(|(_, c)| c).collect();
    assert_eq!(commands, vec!["exit 42".to_string()]);
    assert_eq!(provider.call_count(Operation::CopyFrom), 0);
}

#[tokio::test]
async fn test_failed_sibling_stops_later_siblings() {
    let provider = provider();
    let first = task("first").command("false").build();
    let second = task("second").command("echo second").build();
    let top = task("top")
        .depends_on(first, [])
        .depends_on(second, [])
        .build();

    let err = executor(&provider).execute(&top).await.unwrap_err();

    assert!(matches!(err, TaskError::Dependency { dependency, .. } if dependency == "first"));
    assert!(provider
        .environment_names()
        .iter()
        .all(|name| !name.starts_with("buildvault_second_")));
}

#[tokio::test]
async fn test_environments_are_not_rolled_back() {
    let provider = provider();
    let good = task("good").command("echo ok > /tmp/ok").build();
    let bad = task("bad")
        .depends_on(good.clone(), [Artifact::same_path("/tmp/ok")])
        .command("exit 2")
        .build();

    executor(&provider).execute(&bad).await.unwrap_err();

    let good_env = provider
        .environment_named(&executor(&provider).environment_name(&good))
        .unwrap();
    let bad_env = provider
        .environment_named(&executor(&provider).environment_name(&bad))
        .unwrap();
    assert_eq!(provider.environment_state(&good_env), Some(EnvironmentState::Exited));
    assert_eq!(provider.environment_state(&bad_env), Some(EnvironmentState::Running));
}

#[tokio::test]
async fn test_provisioning_failures_name_the_stage() {
    let cases = [
        (Operation::ImageExists, ProvisionStage::PullImage),
        (Operation::PullImage, ProvisionStage::PullImage),
        (Operation::CreateEnvironment, ProvisionStage::Create),
        (Operation::StartEnvironment, ProvisionStage::Start),
        (Operation::StopEnvironment, ProvisionStage::Stop),
    ];

    for (operation, expected) in cases {
        let provider = provider();
        provider.fail_next(operation);
        let t = task("prov").command("true").build();

        let err = executor(&provider).execute(&t).await.unwrap_err();

        match err {
            TaskError::Provisioning { task, stage, .. } => {
                assert_eq!(task, "prov");
                assert_eq!(stage, expected, "failing {:?}", operation);
            }
            other => panic!("Expected Provisioning error for {:?}, got {:?}", operation, other),
        }
    }
}

#[tokio::test]
async fn test_exec_failure_is_command_exec_error() {
    let provider = provider();
    provider.fail_next(Operation::Exec);
    let t = task("t").command("echo hi").build();

    let err = executor(&provider).execute(&t).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::CommandExec { task, command, .. } if task == "t" && command == "echo hi"
    ));
}

#[tokio::test]
async fn test_copy_failure_is_transfer_error() {
    let provider = provider();
    let up = task("up").command("echo x > /tmp/x").build();
    let down = task("down")
        .depends_on(up, [Artifact::new("/tmp/x", "/data/x")])
        .build();
    provider.fail_next(Operation::CopyTo);

    let err = executor(&provider).execute(&down).await.unwrap_err();

    match err {
        TaskError::Transfer { task, from, to, .. } => {
            assert_eq!(task, "down");
            assert_eq!(from, "/tmp/x");
            assert_eq!(to, "/data/x");
        }
        other => panic!("Expected Transfer error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unpullable_image_never_creates() {
    let provider = Arc::new(InMemoryProvider::new().with_unpullable_image("ghost:latest"));
    let t = buildvault::Task::builder("ghost", "ghost:latest").build();

    let err = executor(&provider).execute(&t).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "task 'ghost': failed to pull image: not found: manifest for ghost:latest not found"
    );
    assert_eq!(provider.call_count(Operation::CreateEnvironment), 0);
}
