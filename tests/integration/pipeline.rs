//! Artifact propagation tests.
//!
//! Files produced in one environment must show up in dependents exactly as
//! declared, without touching the upstream copy.

use crate::common::{IMAGE, executor, provider, read_env_file, task};
use buildvault::testing::{InMemoryProvider, Operation, ProviderCall};
use buildvault::{Artifact, Task, TaskError, TransferError};
use std::sync::Arc;

#[tokio::test]
async fn test_artifact_propagates_downstream() {
    let provider = provider();
    let producer = task("producer")
        .command("mkdir -p /output")
        .command("echo 'v1' > /output/x.txt")
        .build();
    let consumer = task("consumer")
        .depends_on(producer.clone(), [Artifact::same_path("/output/x.txt")])
        .command("echo 'v2' >> /output/x.txt")
        .command("grep -q 'v1' /output/x.txt || exit 1")
        .build();

    let report = executor(&provider).execute(&consumer).await.unwrap();

    assert_eq!(
        read_env_file(&provider, &report, &consumer, "/output/x.txt"),
        "v1\nv2\n"
    );
    assert_eq!(
        read_env_file(&provider, &report, &producer, "/output/x.txt"),
        "v1\n"
    );
    assert_eq!(report.task_count(), 2);
    assert_eq!(report.tasks()[0].task, "producer");
    assert_eq!(report.tasks()[1].task, "consumer");
}

#[tokio::test]
async fn test_multi_source_merge_is_order_independent() {
    for reversed in [false, true] {
        let provider = provider();
        let first = task("first")
            .command("mkdir -p /out")
            .command("echo 'from first' > /out/a.txt")
            .build();
        let second = task("second")
            .command("mkdir -p /out")
            .command("echo 'from second' > /out/b.txt")
            .build();

        let mut deps = vec![
            (first, Artifact::new("/out/a.txt", "/in/a.txt")),
            (second, Artifact::new("/out/b.txt", "/in/b.txt")),
        ];
        if reversed {
            deps.reverse();
        }

        let mut builder = task("merge");
        for (upstream, artifact) in deps {
            builder = builder.depends_on(upstream, [artifact]);
        }
        let merge = builder
            .command("cat /in/a.txt /in/b.txt > /in/merged.txt")
            .build();

        let report = executor(&provider).execute(&merge).await.unwrap();

        assert_eq!(
            read_env_file(&provider, &report, &merge, "/in/merged.txt"),
            "from first\nfrom second\n"
        );
    }
}

#[tokio::test]
async fn test_artifact_can_be_renamed() {
    let provider = provider();
    let build = task("build")
        .command("mkdir -p /build")
        .command("echo binary > /build/app-linux-amd64")
        .build();
    let package = task("package")
        .depends_on(build, [Artifact::new("/build/app-linux-amd64", "/pkg/usr/bin/app")])
        .command("grep -q binary /pkg/usr/bin/app")
        .build();

    let report = executor(&provider).execute(&package).await.unwrap();

    let id = report.environment_id(&package).unwrap();
    assert!(provider.read_file(id, "/pkg/usr/bin/app").is_some());
    assert!(provider.read_file(id, "/pkg/usr/bin/app-linux-amd64").is_none());
    assert!(provider.exec_log(id).contains(&"mkdir -p '/pkg/usr/bin'".to_string()));
}

#[tokio::test]
async fn test_relative_destination_lands_in_working_directory() {
    let provider = provider();
    let upstream = task("upstream").command("echo hi > /tmp/hi.txt").build();
    let downstream = task("downstream")
        .depends_on(upstream, [Artifact::new("/tmp/hi.txt", "hi.txt")])
        .command("cat hi.txt")
        .build();

    let report = executor(&provider).execute(&downstream).await.unwrap();

    let id = report.environment_id(&downstream).unwrap();
    assert_eq!(provider.exec_log(id), vec!["pwd", "cat hi.txt"]);
    assert!(provider.calls().iter().any(|call| matches!(
        call,
        ProviderCall::CopyTo { name, dest_dir } if name.starts_with("buildvault_downstream_") && dest_dir == "/"
    )));
}

#[tokio::test]
async fn test_relative_destination_follows_image_workdir() {
    let provider = Arc::new(InMemoryProvider::new().with_workdir(IMAGE, "/work"));
    let upstream = task("upstream").command("echo hi > /tmp/hi.txt").build();
    let downstream = task("downstream")
        .depends_on(
            upstream,
            [
                Artifact::new("/tmp/hi.txt", "hi.txt"),
                Artifact::new("/tmp/hi.txt", "conf/hi.txt"),
            ],
        )
        .command("cat hi.txt conf/hi.txt")
        .build();

    let report = executor(&provider).execute(&downstream).await.unwrap();

    assert_eq!(read_env_file(&provider, &report, &downstream, "/work/hi.txt"), "hi\n");
    assert_eq!(
        read_env_file(&provider, &report, &downstream, "/work/conf/hi.txt"),
        "hi\n"
    );
    let id = report.environment_id(&downstream).unwrap();
    assert!(provider.read_file(id, "/hi.txt").is_none());
}

#[tokio::test]
async fn test_artifacts_copied_after_all_dependencies_ran() {
    let provider = provider();
    let a = task("a").command("echo a > /tmp/a").build();
    let b = task("b").command("echo b > /tmp/b").build();
    let top = task("top")
        .depends_on(a, [Artifact::same_path("/tmp/a")])
        .depends_on(b, [Artifact::same_path("/tmp/b")])
        .build();

    executor(&provider).execute(&top).await.unwrap();

    let calls = provider.calls();
    let last_exec = calls
        .iter()
        .rposition(|c| matches!(c, ProviderCall::Exec { name, .. } if name.starts_with("buildvault_b_")))
        .unwrap();
    let first_copy = calls
        .iter()
        .position(|c| matches!(c, ProviderCall::CopyFrom { .. }))
        .unwrap();
    assert!(last_exec < first_copy);
}

#[tokio::test]
async fn test_outputs_captured_on_host() {
    let provider = provider();
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    std::fs::create_dir_all(&artifacts).unwrap();
    std::fs::write(artifacts.join("report.txt"), "stale").unwrap();

    let build = task("build")
        .command("mkdir -p /out")
        .command("echo fresh > /out/report.txt")
        .output("/out/report.txt")
        .artifacts_dir(&artifacts)
        .build();

    executor(&provider).execute(&build).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(artifacts.join("report.txt")).unwrap(),
        "fresh\n"
    );
}

#[tokio::test]
async fn test_missing_output_fails_task() {
    let provider = provider();
    let dir = tempfile::tempdir().unwrap();
    let build: std::sync::Arc<Task> = task("build")
        .command("true")
        .output("/out/never-written.txt")
        .artifacts_dir(dir.path())
        .build();

    let err = executor(&provider).execute(&build).await.unwrap_err();

    match err {
        TaskError::Transfer {
            task,
            from,
            source: TransferError::SourceMissing { .. },
            ..
        } => {
            assert_eq!(task, "build");
            assert_eq!(from, "/out/never-written.txt");
        }
        other => panic!("Expected Transfer error, got {:?}", other),
    }
    assert!(!dir.path().join("never-written.txt").exists());
}

#[tokio::test]
async fn test_host_input_feeds_build() {
    let provider = provider();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.go");
    std::fs::write(&source, "package main\n").unwrap();

    let compile = task("compile")
        .input(&source, "/go/src/app/main.go")
        .command("mkdir -p /build")
        .command("grep -q 'package main' /go/src/app/main.go && echo binary > /build/app")
        .build();
    let package = task("package")
        .depends_on(compile.clone(), [Artifact::new("/build/app", "/dist/app")])
        .command("grep -q binary /dist/app")
        .build();

    let report = executor(&provider).execute(&package).await.unwrap();

    assert_eq!(
        read_env_file(&provider, &report, &compile, "/go/src/app/main.go"),
        "package main\n"
    );
    assert_eq!(read_env_file(&provider, &report, &package, "/dist/app"), "binary\n");
    assert_eq!(std::fs::read_to_string(&source).unwrap(), "package main\n");
}

#[tokio::test]
async fn test_missing_host_input_stops_task() {
    let provider = provider();
    let dir = tempfile::tempdir().unwrap();
    let build = task("build")
        .input(dir.path().join("missing.go"), "/src/missing.go")
        .command("true")
        .build();

    let err = executor(&provider).execute(&build).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Transfer {
            source: TransferError::HostRead { .. },
            ..
        }
    ));
    assert_eq!(provider.call_count(Operation::Exec), 0);
    assert_eq!(provider.call_count(Operation::StopEnvironment), 0);
}

#[tokio::test]
async fn test_outputs_of_one_run_feed_the_next() {
    let provider = provider();
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");

    let generate = task("generate")
        .command("mkdir -p /out")
        .command("echo 'generated' > /out/schema.txt")
        .output("/out/schema.txt")
        .artifacts_dir(&artifacts)
        .build();
    executor(&provider).execute(&generate).await.unwrap();

    let consume = task("consume")
        .input(artifacts.join("schema.txt"), "schema.txt")
        .command("grep -q generated schema.txt")
        .build();
    let report = executor(&provider).execute(&consume).await.unwrap();

    assert_eq!(read_env_file(&provider, &report, &consume, "/schema.txt"), "generated\n");
}
