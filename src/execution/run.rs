//! Per-run execution state and the report handed back to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::core::fingerprint::Fingerprint;
use crate::core::task::Task;
use crate::core::types::{EnvironmentId, RunId};

/// Result of executing one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    /// Name of the task.
    pub task: String,
    /// Fingerprint the environment was named after.
    pub fingerprint: Fingerprint,
    /// Name of the environment.
    pub environment_name: String,
    /// Provider-assigned environment id.
    pub environment_id: EnvironmentId,
    /// Time from reclaim to teardown, including dependencies.
    pub duration: Duration,
}

/// Execution record of one top-level run, keyed by fingerprint.
///
/// Task definitions are shared and immutable, so everything a run learns
/// about a task (its environment, whether it already ran) lives here. A task
/// reached through several paths shares one cell and executes once.
#[derive(Debug, Default)]
pub struct RunState {
    cells: Mutex<HashMap<Fingerprint, Arc<OnceCell<TaskResult>>>>,
    environments: Mutex<HashMap<Fingerprint, EnvironmentId>>,
    completed: Mutex<Vec<TaskResult>>,
}

impl RunState {
    /// Create an empty run state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the once-cell guarding execution of the task with `fingerprint`.
    pub(crate) fn cell(&self, fingerprint: &Fingerprint) -> Arc<OnceCell<TaskResult>> {
        Arc::clone(
            lock(&self.cells)
                .entry(fingerprint.clone())
                .or_default(),
        )
    }

    /// Record the environment created for a task.
    pub(crate) fn record_environment(&self, fingerprint: &Fingerprint, id: EnvironmentId) {
        lock(&self.environments).insert(fingerprint.clone(), id);
    }

    /// Record a finished task.
    pub(crate) fn record_completed(&self, result: TaskResult) {
        lock(&self.completed).push(result);
    }

    /// Get the environment created for `task` in this run, if any.
    ///
    /// Environments are recorded as soon as they are created, so this also
    /// answers for tasks that failed.
    pub fn environment_id(&self, task: &Task) -> Option<EnvironmentId> {
        lock(&self.environments)
            .get(&Fingerprint::of(task))
            .cloned()
    }

    /// Get the result of a task that finished in this run.
    pub fn result(&self, task: &Task) -> Option<TaskResult> {
        let fingerprint = Fingerprint::of(task);
        lock(&self.cells)
            .get(&fingerprint)
            .and_then(|cell| cell.get().cloned())
    }

    /// Finished tasks in completion order.
    pub fn completed(&self) -> Vec<TaskResult> {
        lock(&self.completed).clone()
    }

    pub(crate) fn into_report(self, run_id: RunId, duration: Duration) -> RunReport {
        let completed = self
            .completed
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        RunReport {
            run_id,
            duration,
            completed,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Identifier of the run, also attached to its log span.
    pub run_id: RunId,
    /// Total duration of the run.
    pub duration: Duration,
    #[serde(rename = "tasks")]
    completed: Vec<TaskResult>,
}

impl RunReport {
    /// Executed tasks in completion order. The root task comes last.
    pub fn tasks(&self) -> &[TaskResult] {
        &self.completed
    }

    /// Get the number of executed tasks.
    pub fn task_count(&self) -> usize {
        self.completed.len()
    }

    /// Get the result for `task`.
    pub fn get(&self, task: &Task) -> Option<&TaskResult> {
        let fingerprint = Fingerprint::of(task);
        self.completed.iter().find(|r| r.fingerprint == fingerprint)
    }

    /// Get the environment `task` ran in.
    pub fn environment_id(&self, task: &Task) -> Option<&EnvironmentId> {
        self.get(task).map(|r| &r.environment_id)
    }

    /// Get the result for the task named `name`.
    pub fn by_name(&self, name: &str) -> Option<&TaskResult> {
        self.completed.iter().find(|r| r.task == name)
    }
}
