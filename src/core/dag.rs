//! Validation of task dependency graphs.
//!
//! Tasks reference their upstream tasks through `Arc`, so the object graph
//! itself is always finite. A cycle exists when a task's fingerprint appears
//! again among its own ancestors, which happens when two definitions share
//! the same identity (for example `A -> B -> A'` where `A'` is defined like `A`).

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use super::fingerprint::Fingerprint;
use super::task::Task;

/// Errors that can occur when validating a task graph.
#[derive(Debug, Error)]
pub enum DagError {
    /// A cycle was detected in the graph.
    #[error("cycle detected involving task '{task}': {}", .path.join(" -> "))]
    CycleDetected { task: String, path: Vec<String> },

    /// Two different definitions use the same task name.
    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    /// A task has an empty name.
    #[error("task name cannot be empty")]
    EmptyName,

    /// A task name can't be used in an environment name.
    #[error("invalid task name '{0}': use letters, digits, '_', '.' or '-'")]
    InvalidName(String),

    /// A task has no base image.
    #[error("task '{0}' has no base image")]
    MissingImage(String),
}

/// Check that no task's fingerprint repeats along any dependency path.
pub fn is_acyclic(task: &Task) -> bool {
    check_cycles(task, Vec::new()).is_ok()
}

/// Validate a whole graph rooted at `task`.
///
/// Returns an error for cycles, duplicate names, and empty or unusable
/// names and images. Nothing is provisioned before this passes.
pub fn validate(task: &Task) -> Result<(), DagError> {
    check_cycles(task, Vec::new())?;

    let mut names: HashMap<String, Fingerprint> = HashMap::new();
    let mut visited: HashSet<*const Task> = HashSet::new();
    check_definitions(task, &mut names, &mut visited)
}

/// All tasks reachable from `task`, dependencies before dependents.
///
/// A task referenced from several places is listed once, at its first
/// position in depth-first order.
pub fn execution_order(task: &Arc<Task>) -> Vec<Arc<Task>> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    collect_post_order(task, &mut seen, &mut order);
    order
}

// Each call gets its own copy of the ancestor path so siblings don't see
// each other's entries.
fn check_cycles(task: &Task, mut path: Vec<(Fingerprint, String)>) -> Result<(), DagError> {
    let fingerprint = Fingerprint::of(task);

    if path.iter().any(|(seen, _)| *seen == fingerprint) {
        let mut names: Vec<String> = path.into_iter().map(|(_, name)| name).collect();
        names.push(task.name().to_string());
        return Err(DagError::CycleDetected {
            task: task.name().to_string(),
            path: names,
        });
    }

    path.push((fingerprint, task.name().to_string()));
    for dependency in task.dependencies() {
        check_cycles(dependency.task(), path.clone())?;
    }

    Ok(())
}

// Fingerprints are shallow: two definitions of one task can hash the same
// while depending on different upstream definitions. Every distinct
// definition is walked, so a conflict anywhere below is still reported.
fn check_definitions(
    task: &Task,
    names: &mut HashMap<String, Fingerprint>,
    visited: &mut HashSet<*const Task>,
) -> Result<(), DagError> {
    if !visited.insert(task as *const Task) {
        return Ok(());
    }

    validate_name(task.name())?;
    if task.base_image().trim().is_empty() {
        return Err(DagError::MissingImage(task.name().to_string()));
    }

    let fingerprint = Fingerprint::of(task);
    match names.get(task.name()) {
        Some(existing) if *existing != fingerprint => {
            return Err(DagError::DuplicateTask(task.name().to_string()));
        }
        Some(_) => {}
        None => {
            names.insert(task.name().to_string(), fingerprint);
        }
    }

    for dependency in task.dependencies() {
        check_definitions(dependency.task(), names, visited)?;
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<(), DagError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(DagError::EmptyName);
    };

    let valid_first = first.is_ascii_alphanumeric();
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid_first && valid_rest {
        Ok(())
    } else {
        Err(DagError::InvalidName(name.to_string()))
    }
}

fn collect_post_order(
    task: &Arc<Task>,
    seen: &mut HashSet<Fingerprint>,
    order: &mut Vec<Arc<Task>>,
) {
    let fingerprint = Fingerprint::of(task);
    if seen.contains(&fingerprint) {
        return;
    }
    seen.insert(fingerprint);

    for dependency in task.dependencies() {
        collect_post_order(dependency.task(), seen, order);
    }
    order.push(Arc::clone(task));
}
