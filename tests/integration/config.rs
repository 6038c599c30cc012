//! Pipelines loaded from YAML and run end to end.

use crate::common::{executor_with, provider, read_env_file};
use buildvault::{ConfigError, PipelineBuilder, YamlLoader, load_pipeline};

const PIPELINE: &str = r#"
settings:
  prefix: yamltest
tasks:
  - name: producer
    image: docker.io/library/alpine
    commands:
      - mkdir -p /output
      - echo 'v1' > /output/x.txt
  - name: consumer
    image: docker.io/library/alpine
    depends_on:
      - task: producer
        artifacts:
          - { from: /output/x.txt, to: /output/x.txt }
    commands:
      - echo 'v2' >> /output/x.txt
    outputs: [/output/x.txt]
"#;

#[tokio::test]
async fn test_yaml_pipeline_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}    artifacts_dir: {}\n",
        PIPELINE,
        dir.path().join("out").display()
    );
    let pipeline = PipelineBuilder::build(YamlLoader::parse(&yaml).unwrap()).unwrap();
    let consumer = pipeline.require("consumer").unwrap();
    let provider = provider();

    let report = executor_with(&provider, pipeline.executor_config())
        .execute(consumer)
        .await
        .unwrap();

    assert_eq!(
        read_env_file(&provider, &report, consumer, "/output/x.txt"),
        "v1\nv2\n"
    );
    assert!(report
        .tasks()
        .iter()
        .all(|r| r.environment_name.starts_with("yamltest_")));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out").join("x.txt")).unwrap(),
        "v1\nv2\n"
    );
}

#[tokio::test]
async fn test_pipeline_file_tasks_run_independently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.yaml");
    std::fs::write(&path, PIPELINE).unwrap();
    let pipeline = load_pipeline(&path).unwrap();
    let producer = pipeline.require("producer").unwrap();
    let provider = provider();

    let report = executor_with(&provider, pipeline.executor_config())
        .execute(producer)
        .await
        .unwrap();

    assert_eq!(report.task_count(), 1);
    assert_eq!(
        read_env_file(&provider, &report, producer, "/output/x.txt"),
        "v1\n"
    );
}

#[test]
fn test_cyclic_yaml_rejected() {
    let yaml = r#"
tasks:
  - name: a
    image: alpine
    depends_on: [b]
  - name: b
    image: alpine
    depends_on: [a]
"#;

    let result = YamlLoader::parse(yaml);

    assert!(matches!(result, Err(ConfigError::CyclicDependency(_))));
}
