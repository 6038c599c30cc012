//! Pipeline builder from YAML configuration.
//!
//! This module converts a [`PipelineConfig`] into shared [`Task`] graphs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::dag;
use crate::core::task::{Dependency, Task};
use crate::execution::ExecutorConfig;

use super::error::ConfigError;
use super::yaml::{PipelineConfig, SettingsConfig, TaskConfig, YamlLoader};

/// A loaded pipeline: settings plus every task, resolved into graphs.
#[derive(Debug, Clone)]
pub struct Pipeline {
    settings: SettingsConfig,
    tasks: Vec<Arc<Task>>,
}

impl Pipeline {
    /// Get the pipeline settings.
    pub fn settings(&self) -> &SettingsConfig {
        &self.settings
    }

    /// Executor settings derived from the pipeline settings.
    pub fn executor_config(&self) -> ExecutorConfig {
        self.settings.executor_config()
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// Find a task by name.
    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    /// Find a task by name, failing if it isn't defined.
    pub fn require(&self, name: &str) -> Result<&Arc<Task>, ConfigError> {
        self.task(name)
            .ok_or_else(|| ConfigError::UnknownTask(name.to_string()))
    }
}

/// Builder for creating task graphs from configuration.
pub struct PipelineBuilder;

impl PipelineBuilder {
    /// Build every task of a pipeline.
    ///
    /// Name references are resolved into shared `Arc<Task>` values, so a
    /// task used by several dependents is built once. Cycles are rejected by
    /// name before recursing.
    pub fn build(config: PipelineConfig) -> Result<Pipeline, ConfigError> {
        let configs: HashMap<&str, &TaskConfig> = config
            .tasks
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        let mut built: HashMap<String, Arc<Task>> = HashMap::new();
        let mut tasks = Vec::with_capacity(config.tasks.len());

        for task_config in &config.tasks {
            let mut path = Vec::new();
            let task = Self::resolve(
                &task_config.name,
                &configs,
                &config.settings,
                &mut built,
                &mut path,
            )?;
            dag::validate(&task)?;
            tasks.push(task);
        }

        Ok(Pipeline {
            settings: config.settings,
            tasks,
        })
    }

    fn resolve(
        name: &str,
        configs: &HashMap<&str, &TaskConfig>,
        settings: &SettingsConfig,
        built: &mut HashMap<String, Arc<Task>>,
        path: &mut Vec<String>,
    ) -> Result<Arc<Task>, ConfigError> {
        if let Some(task) = built.get(name) {
            return Ok(Arc::clone(task));
        }

        if let Some(start) = path.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = path[start..].to_vec();
            cycle.sort();
            return Err(ConfigError::CyclicDependency(cycle));
        }

        let config = configs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTask(name.to_string()))?;

        path.push(name.to_string());

        let mut builder = Task::builder(&config.name, &config.image).commands(&config.commands);
        for input in &config.inputs {
            builder = builder.input(&input.from, &input.to);
        }
        for dep in &config.depends_on {
            let upstream = Self::resolve(dep.task_name(), configs, settings, built, path).map_err(
                |e| match e {
                    ConfigError::UnknownTask(dependency) => ConfigError::UnknownDependency {
                        task: config.name.clone(),
                        dependency,
                    },
                    other => other,
                },
            )?;
            builder = builder.dependency(Dependency::new(upstream, dep.artifacts()));
        }
        for output in &config.outputs {
            builder = builder.output(output);
        }
        if let Some(dir) = config.artifacts_dir.as_ref().or(settings.artifacts_dir.as_ref()) {
            builder = builder.artifacts_dir(dir);
        }

        path.pop();

        let task = builder.build();
        built.insert(config.name.clone(), Arc::clone(&task));
        Ok(task)
    }
}

/// Load and build a pipeline file.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline, ConfigError> {
    let config = YamlLoader::load_file(path)?;
    PipelineBuilder::build(config)
}
