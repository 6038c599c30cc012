//! Configuration error types.
//!
//! This module defines error types for pipeline loading and validation.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::dag::DagError;

/// Errors that can occur when loading a pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Two tasks share a name.
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    /// A dependency names a task that isn't defined.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// Task dependencies form a cycle.
    #[error("dependency cycle detected involving tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    /// A task requested by name isn't defined.
    #[error("no task named '{0}' in pipeline")]
    UnknownTask(String),

    /// The built task graph failed validation.
    #[error("invalid task graph: {0}")]
    InvalidGraph(#[from] DagError),
}
