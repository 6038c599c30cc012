//! Common test utilities shared across integration tests.

use buildvault::testing::InMemoryProvider;
use buildvault::{Executor, ExecutorConfig, RunReport, Task, TaskBuilder};
use std::sync::Arc;

/// Base image used by every test task.
pub const IMAGE: &str = "docker.io/library/alpine";

/// Start a task definition on the test image.
pub fn task(name: &str) -> TaskBuilder {
    Task::builder(name, IMAGE)
}

/// Fresh in-memory provider.
pub fn provider() -> Arc<InMemoryProvider> {
    Arc::new(InMemoryProvider::new())
}

/// Executor with default settings over `provider`.
pub fn executor(provider: &Arc<InMemoryProvider>) -> Executor {
    Executor::new(provider.clone())
}

/// Executor with the given settings over `provider`.
pub fn executor_with(provider: &Arc<InMemoryProvider>, config: ExecutorConfig) -> Executor {
    Executor::with_config(provider.clone(), config)
}

/// Read a file from the environment `task` ran in.
///
/// # Panics
///
/// Panics if the task didn't run or the file doesn't exist.
pub fn read_env_file(
    provider: &InMemoryProvider,
    report: &RunReport,
    task: &Task,
    path: &str,
) -> String {
    let id = report
        .environment_id(task)
        .unwrap_or_else(|| panic!("task '{}' did not run", task.name()));
    let contents = provider
        .read_file(id, path)
        .unwrap_or_else(|| panic!("'{}' missing in environment of '{}'", path, task.name()));
    String::from_utf8(contents).unwrap()
}
