//! YAML configuration parsing.
//!
//! Parses pipeline definitions: optional executor settings and a list of
//! tasks referring to each other by name.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use crate::core::task::{Artifact, Input};
use crate::execution::ExecutorConfig;

/// Default runtime client binary.
pub const DEFAULT_RUNTIME: &str = "docker";

/// A pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Executor settings.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Task definitions.
    pub tasks: Vec<TaskConfig>,
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Environment name prefix.
    pub prefix: Option<String>,
    /// Runtime client binary (`docker`, `podman`, ...).
    pub runtime: Option<String>,
    /// Dependency fan-out.
    pub concurrency: Option<usize>,
    /// Host directory for captured outputs, unless a task sets its own.
    pub artifacts_dir: Option<PathBuf>,
}

impl SettingsConfig {
    /// Get the runtime client binary.
    pub fn runtime(&self) -> &str {
        self.runtime.as_deref().unwrap_or(DEFAULT_RUNTIME)
    }

    /// Build executor settings, falling back to the defaults.
    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        if let Some(prefix) = &self.prefix {
            config = config.with_prefix(prefix);
        }
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        config
    }
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name (unique within the pipeline).
    pub name: String,
    /// Base image.
    pub image: String,
    /// Host files copied in before dependencies run.
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    /// Shell commands, run in order.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Upstream tasks and the artifacts taken from them.
    #[serde(default)]
    pub depends_on: Vec<DependencyConfig>,
    /// Paths copied onto the host after a successful run.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Host directory for outputs.
    pub artifacts_dir: Option<PathBuf>,
}

/// Host input configuration. Relative host paths resolve against the
/// current directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Path on the host.
    pub from: PathBuf,
    /// Path inside the environment.
    pub to: String,
}

impl InputConfig {
    /// Convert into an [`Input`].
    pub fn to_input(&self) -> Input {
        Input::new(&self.from, &self.to)
    }
}

/// Dependency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyConfig {
    /// Order-only dependency (task name only, no artifacts).
    Simple(String),
    /// Dependency with artifacts.
    Detailed {
        /// Upstream task name.
        task: String,
        /// Files copied from the upstream environment.
        #[serde(default)]
        artifacts: Vec<ArtifactConfig>,
    },
}

impl DependencyConfig {
    /// Get the upstream task name.
    pub fn task_name(&self) -> &str {
        match self {
            DependencyConfig::Simple(name) => name,
            DependencyConfig::Detailed { task, .. } => task,
        }
    }

    /// Get the artifact mappings.
    pub fn artifacts(&self) -> Vec<Artifact> {
        match self {
            DependencyConfig::Simple(_) => Vec::new(),
            DependencyConfig::Detailed { artifacts, .. } => {
                artifacts.iter().map(ArtifactConfig::to_artifact).collect()
            }
        }
    }
}

/// Artifact configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactConfig {
    /// Same path on both sides.
    Same(String),
    /// Explicit source and destination.
    Mapped {
        /// Path in the upstream environment.
        from: String,
        /// Path in this task's environment.
        to: String,
    },
}

impl ArtifactConfig {
    /// Convert into an [`Artifact`].
    pub fn to_artifact(&self) -> Artifact {
        match self {
            ArtifactConfig::Same(path) => Artifact::same_path(path),
            ArtifactConfig::Mapped { from, to } => Artifact::new(from, to),
        }
    }
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load a pipeline from a file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Parse a pipeline from a YAML string.
    pub fn parse(yaml: &str) -> Result<PipelineConfig, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a pipeline configuration.
    pub fn validate(config: &PipelineConfig) -> Result<(), ConfigError> {
        if config.tasks.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "pipeline must have at least one task".into(),
            ));
        }

        if config.settings.concurrency == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "concurrency cannot be zero".into(),
            ));
        }

        let mut names: HashSet<&str> = HashSet::new();
        for (idx, task) in config.tasks.iter().enumerate() {
            if task.name.is_empty() {
                return Err(ConfigError::MissingField(format!("tasks[{}].name", idx)));
            }
            if task.image.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "tasks[{}].image",
                    idx
                )));
            }
            for (input_idx, input) in task.inputs.iter().enumerate() {
                if input.from.as_os_str().is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "tasks[{}].inputs[{}].from",
                        idx, input_idx
                    )));
                }
                if input.to.is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "tasks[{}].inputs[{}].to",
                        idx, input_idx
                    )));
                }
            }
            if !names.insert(&task.name) {
                return Err(ConfigError::DuplicateTask(task.name.clone()));
            }
        }

        for task in &config.tasks {
            let mut seen_deps = HashSet::new();
            for dep in &task.depends_on {
                let dep_name = dep.task_name();
                if dep_name == task.name {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' cannot depend on itself",
                        task.name
                    )));
                }
                if !names.contains(dep_name) {
                    return Err(ConfigError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep_name.to_string(),
                    });
                }
                if !seen_deps.insert(dep_name) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' has duplicate dependency '{}'",
                        task.name, dep_name
                    )));
                }
            }
        }

        Self::validate_no_cycles(config)
    }

    /// Validate that there are no cycles in the task dependency graph.
    fn validate_no_cycles(config: &PipelineConfig) -> Result<(), ConfigError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut reverse_deps: HashMap<&str, Vec<&str>> = HashMap::new();

        for task in &config.tasks {
            in_degree.insert(&task.name, task.depends_on.len());
            reverse_deps.insert(&task.name, Vec::new());
        }

        for task in &config.tasks {
            for dep in &task.depends_on {
                reverse_deps
                    .entry(dep.task_name())
                    .or_default()
                    .push(&task.name);
            }
        }

        // Kahn's algorithm: start with tasks that have no dependencies
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut visited_count = 0;

        while let Some(name) = queue.pop_front() {
            visited_count += 1;

            if let Some(downstream) = reverse_deps.get(name) {
                for next in downstream {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if visited_count != config.tasks.len() {
            let mut cycle_tasks: Vec<String> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            cycle_tasks.sort();
            return Err(ConfigError::CyclicDependency(cycle_tasks));
        }

        Ok(())
    }
}
