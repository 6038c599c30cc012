//! Graph shape tests: chains, diamonds, cycles and bounded fan-out.

use crate::common::{executor, executor_with, provider, read_env_file, task};
use buildvault::testing::{InMemoryProvider, Operation};
use buildvault::{Artifact, DagError, ExecutorConfig, TaskError};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_linear_chain_runs_depth_first() {
    let provider = provider();
    let c = task("c").command("echo c").build();
    let b = task("b").depends_on(c, []).command("echo b").build();
    let a = task("a").depends_on(b, []).command("echo a").build();

    let report = executor(&provider).execute(&a).await.unwrap();

    let commands: Vec<String> = provider.commands().into_iter().map(|(_, c)| c).collect();
    assert_eq!(commands, vec!["echo c", "echo b", "echo a"]);
    let order: Vec<&str> = report.tasks().iter().map(|r| r.task.as_str()).collect();
    assert_eq!(order, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_diamond_runs_shared_task_once() {
    let provider = provider();
    let d = task("d")
        .command("mkdir -p /out")
        .command("echo d >> /out/d.txt")
        .build();
    let b = task("b")
        .depends_on(d.clone(), [Artifact::same_path("/out/d.txt")])
        .command("cat /out/d.txt > /out/b.txt")
        .build();
    let c = task("c")
        .depends_on(d.clone(), [Artifact::same_path("/out/d.txt")])
        .command("cat /out/d.txt > /out/c.txt")
        .build();
    let a = task("a")
        .depends_on(b.clone(), [Artifact::same_path("/out/b.txt")])
        .depends_on(c.clone(), [Artifact::same_path("/out/c.txt")])
        .command("cat /out/b.txt /out/c.txt > /out/a.txt")
        .build();

    let report = executor(&provider).execute(&a).await.unwrap();

    assert_eq!(report.task_count(), 4);
    assert_eq!(provider.call_count(Operation::CreateEnvironment), 4);
    let d_runs = provider
        .commands()
        .iter()
        .filter(|(_, command)| command == "echo d >> /out/d.txt")
        .count();
    assert_eq!(d_runs, 1);
    assert_eq!(read_env_file(&provider, &report, &d, "/out/d.txt"), "d\n");
    assert_eq!(read_env_file(&provider, &report, &a, "/out/a.txt"), "d\nd\n");
}

#[tokio::test]
async fn test_cycle_rejected_before_any_side_effect() {
    let provider = provider();
    // a -> b -> a', where a' has the same identity as a.
    let inner_b = task("b").command("echo inner").build();
    let inner_a = task("a").command("make").depends_on(inner_b, []).build();
    let b = task("b").command("echo b").depends_on(inner_a, []).build();
    let a = task("a").command("make").depends_on(b, []).build();

    let err = executor(&provider).execute(&a).await.unwrap_err();

    assert!(err.is_cycle());
    match err {
        TaskError::Cycle(DagError::CycleDetected { path, .. }) => {
            assert_eq!(path, vec!["a", "b", "a"]);
        }
        other => panic!("Expected Cycle error, got {:?}", other),
    }
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_conflicting_definitions_rejected() {
    let provider = provider();
    let one = task("lib").command("echo one").build();
    let two = task("lib").command("echo two").build();
    let top = task("top").depends_on(one, []).depends_on(two, []).build();

    let err = executor(&provider).execute(&top).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Configuration(DagError::DuplicateTask(name)) if name == "lib"
    ));
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_conflict_hidden_behind_matching_definitions_rejected() {
    let provider = provider();
    let one = task("b").command("mkdir -p /o").command("echo one > /o/o.txt").build();
    let two = task("b").command("mkdir -p /o").command("echo two > /o/o.txt").build();
    let via_x = task("x")
        .depends_on(task("a").depends_on(one, [Artifact::same_path("/o/o.txt")]).build(), [])
        .build();
    let via_y = task("y")
        .depends_on(task("a").depends_on(two, [Artifact::same_path("/o/o.txt")]).build(), [])
        .build();
    let root = task("root").depends_on(via_x, []).depends_on(via_y, []).build();

    let err = executor(&provider).execute(&root).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Configuration(DagError::DuplicateTask(name)) if name == "b"
    ));
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_sequential_by_default() {
    let provider = Arc::new(InMemoryProvider::new().with_exec_delay(Duration::from_millis(20)));
    let top = task("top")
        .depends_on(task("x").command("echo x").build(), [])
        .depends_on(task("y").command("echo y").build(), [])
        .depends_on(task("z").command("echo z").build(), [])
        .build();

    executor(&provider).execute(&top).await.unwrap();

    assert_eq!(provider.max_concurrent_execs(), 1);
    let commands: Vec<String> = provider.commands().into_iter().map(|(_, c)| c).collect();
    assert_eq!(commands, vec!["echo x", "echo y", "echo z"]);
}

#[tokio::test]
async fn test_bounded_fan_out() {
    let provider = Arc::new(InMemoryProvider::new().with_exec_delay(Duration::from_millis(50)));
    let mut builder = task("top");
    for name in ["w", "x", "y", "z"] {
        let upstream = task(name)
            .command(format!("echo {} > /tmp/{}", name, name))
            .build();
        builder = builder.depends_on(upstream, [Artifact::same_path(format!("/tmp/{}", name))]);
    }
    let top = builder.command("cat /tmp/w /tmp/x /tmp/y /tmp/z > /tmp/all").build();
    let config = ExecutorConfig::default().with_concurrency(2);

    let report = executor_with(&provider, config).execute(&top).await.unwrap();

    assert_eq!(provider.max_concurrent_execs(), 2);
    assert_eq!(
        read_env_file(&provider, &report, &top, "/tmp/all"),
        "w\nx\ny\nz\n"
    );
}
