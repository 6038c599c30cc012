//! buildvault - A minimal build orchestrator running task graphs in containers.
//!
//! Each [`Task`] runs its shell commands in a fresh environment created from
//! a base image. Dependencies run first and hand files to their dependents
//! as [`Artifact`]s. Environments are named after a [`Fingerprint`] of the
//! task definition and are rebuilt on every run.

pub mod config;
pub mod core;
pub mod execution;
pub mod provider;
pub mod testing;
pub mod transfer;

pub use config::{ConfigError, Pipeline, PipelineBuilder, PipelineConfig, YamlLoader, load_pipeline};
pub use core::dag::{DagError, execution_order, is_acyclic, validate};
pub use core::fingerprint::{Fingerprint, environment_name, fingerprint};
pub use core::task::{
    Artifact, Dependency, Input, ProvisionStage, Task, TaskBuilder, TaskError,
};
pub use core::types::{EnvironmentId, RunId};
pub use execution::{Executor, ExecutorConfig, RunReport, RunState, TaskResult};
pub use provider::{
    DockerCli, EnvironmentProvider, EnvironmentState, EnvironmentSummary, ExecOutput,
    OutputSink, OutputStream, ProviderError,
};
pub use transfer::{TransferError, copy_artifact, copy_from_host, extract_to_host};
