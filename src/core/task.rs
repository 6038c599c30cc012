//! Task, dependency and artifact definitions.
//!
//! A [`Task`] is a static definition: a base image, host files to copy in,
//! an ordered list of shell commands and an ordered list of upstream
//! [`Dependency`] values. Tasks are
//! immutable once built and are shared between dependents through `Arc`, so
//! one upstream task may feed several downstream tasks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dag::DagError;
use crate::provider::ProviderError;
use crate::transfer::TransferError;

/// Host directory used for captured outputs when a task doesn't set one.
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";

/// Provisioning step that failed, used in [`TaskError::Provisioning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    /// Looking up environments left over from an earlier run.
    Lookup,
    /// Checking for or pulling the base image.
    PullImage,
    /// Creating the environment.
    Create,
    /// Starting the environment.
    Start,
    /// Stopping the environment after the commands ran.
    Stop,
    /// Removing an environment.
    Remove,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            ProvisionStage::Lookup => "look up existing environments",
            ProvisionStage::PullImage => "pull image",
            ProvisionStage::Create => "create environment",
            ProvisionStage::Start => "start environment",
            ProvisionStage::Stop => "stop environment",
            ProvisionStage::Remove => "remove environment",
        };
        f.write_str(stage)
    }
}

/// Errors that can occur while executing a task graph.
///
/// Every variant is terminal for the task that raised it and, through
/// [`TaskError::Dependency`], for every task downstream of it.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A task definition is missing or has invalid fields.
    #[error("invalid task graph: {0}")]
    Configuration(#[source] DagError),

    /// The dependency graph contains a cycle.
    #[error("invalid task graph: {0}")]
    Cycle(#[source] DagError),

    /// The environment provider failed to pull, create, start, stop or remove.
    #[error("task '{task}': failed to {stage}: {source}")]
    Provisioning {
        task: String,
        stage: ProvisionStage,
        #[source]
        source: ProviderError,
    },

    /// An upstream task failed.
    #[error("task '{task}': dependency '{dependency}' failed: {source}")]
    Dependency {
        task: String,
        dependency: String,
        #[source]
        source: Box<TaskError>,
    },

    /// Copying an artifact between environments or onto the host failed.
    #[error("task '{task}': failed to copy artifact '{from}' to '{to}': {source}")]
    Transfer {
        task: String,
        from: String,
        to: String,
        #[source]
        source: TransferError,
    },

    /// A command could not be run at all.
    #[error("task '{task}': failed to run command '{command}': {source}")]
    CommandExec {
        task: String,
        command: String,
        #[source]
        source: ProviderError,
    },

    /// A command ran and exited with a non-zero code.
    #[error("task '{task}': command '{command}' exited with code {exit_code}")]
    Command {
        task: String,
        command: String,
        exit_code: i32,
    },
}

impl TaskError {
    /// Follow [`TaskError::Dependency`] wrappers down to the originating error.
    pub fn root_cause(&self) -> &TaskError {
        match self {
            TaskError::Dependency { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if the error reports a dependency cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self.root_cause(), TaskError::Cycle(_))
    }
}

impl From<DagError> for TaskError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::CycleDetected { .. } => TaskError::Cycle(err),
            other => TaskError::Configuration(other),
        }
    }
}

/// A single file pulled from an upstream environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    /// Path inside the upstream environment.
    pub from: String,
    /// Path inside the downstream environment.
    pub to: String,
}

impl Artifact {
    /// Create a new artifact mapping.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Map a path to the same location in the downstream environment.
    pub fn same_path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            from: path.clone(),
            to: path,
        }
    }
}

/// A host file copied into the environment before anything else runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Input {
    /// Path on the host.
    pub from: PathBuf,
    /// Path inside the environment.
    pub to: String,
}

impl Input {
    /// Create a new input mapping.
    pub fn new(from: impl Into<PathBuf>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A reference to an upstream task plus the files to pull from it.
#[derive(Debug, Clone)]
pub struct Dependency {
    task: Arc<Task>,
    artifacts: Vec<Artifact>,
}

impl Dependency {
    /// Create a dependency on `task` pulling the given artifacts.
    pub fn new(task: Arc<Task>, artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        Self {
            task,
            artifacts: artifacts.into_iter().collect(),
        }
    }

    /// The upstream task.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The artifacts copied from the upstream environment.
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }
}

/// A named unit of work run inside its own environment.
///
/// # Example
///
/// ```
/// use buildvault::{Artifact, Task};
///
/// let producer = Task::builder("producer", "docker.io/library/alpine")
///     .command("mkdir -p /output")
///     .command("echo v1 > /output/x.txt")
///     .build();
///
/// let consumer = Task::builder("consumer", "docker.io/library/alpine")
///     .depends_on(producer, [Artifact::same_path("/output/x.txt")])
///     .command("echo v2 >> /output/x.txt")
///     .output("/output/x.txt")
///     .build();
///
/// assert_eq!(consumer.dependencies().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    base_image: String,
    inputs: Vec<Input>,
    commands: Vec<String>,
    dependencies: Vec<Dependency>,
    outputs: Vec<String>,
    artifacts_dir: Option<PathBuf>,
}

impl Task {
    /// Create a new builder for a task.
    pub fn builder(name: impl Into<String>, base_image: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name, base_image)
    }

    /// The task name, unique within a graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The image the environment is created from.
    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    /// Host files copied in after the environment starts.
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Shell commands, in execution order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Upstream dependencies, in declared order.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Paths inside the environment captured onto the host after a run.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Host directory for captured outputs.
    pub fn artifacts_dir(&self) -> &Path {
        self.artifacts_dir
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_ARTIFACTS_DIR))
    }
}

/// Builder for creating [`Task`] instances.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    base_image: String,
    inputs: Vec<Input>,
    commands: Vec<String>,
    dependencies: Vec<Dependency>,
    outputs: Vec<String>,
    artifacts_dir: Option<PathBuf>,
}

impl TaskBuilder {
    /// Create a new builder with the given name and base image.
    pub fn new(name: impl Into<String>, base_image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_image: base_image.into(),
            inputs: Vec::new(),
            commands: Vec::new(),
            dependencies: Vec::new(),
            outputs: Vec::new(),
            artifacts_dir: None,
        }
    }

    /// Copy the host file `from` to `to` inside the environment.
    pub fn input(mut self, from: impl Into<PathBuf>, to: impl Into<String>) -> Self {
        self.inputs.push(Input::new(from, to));
        self
    }

    /// Append a single command.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Append multiple commands.
    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Depend on `task`, pulling the given artifacts into this task's environment.
    pub fn depends_on(
        mut self,
        task: Arc<Task>,
        artifacts: impl IntoIterator<Item = Artifact>,
    ) -> Self {
        self.dependencies.push(Dependency::new(task, artifacts));
        self
    }

    /// Append an already constructed dependency.
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Capture a file onto the host after the task succeeds.
    pub fn output(mut self, path: impl Into<String>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Set the host directory for captured outputs.
    pub fn artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Build the task, ready to be shared by dependents.
    pub fn build(self) -> Arc<Task> {
        Arc::new(Task {
            name: self.name,
            base_image: self.base_image,
            inputs: self.inputs,
            commands: self.commands,
            dependencies: self.dependencies,
            outputs: self.outputs,
            artifacts_dir: self.artifacts_dir,
        })
    }
}
