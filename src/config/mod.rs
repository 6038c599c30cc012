//! Configuration loading and parsing.
//!
//! This module provides YAML-based pipeline definitions and the executor
//! settings they carry.

mod builder;
mod error;
mod yaml;

pub use builder::{Pipeline, PipelineBuilder, load_pipeline};
pub use error::ConfigError;
pub use yaml::{
    ArtifactConfig, DEFAULT_RUNTIME, DependencyConfig, InputConfig, PipelineConfig,
    SettingsConfig, TaskConfig, YamlLoader,
};
