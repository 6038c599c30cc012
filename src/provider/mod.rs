//! Environment providers.
//!
//! The executor never talks to a container runtime directly. Everything it
//! needs (images, environment lifecycle, exec, and archive copies in and
//! out) goes through the [`EnvironmentProvider`] trait.
//!
//! Files cross the boundary as tar archives, the convention container
//! runtimes use for their copy APIs: [`EnvironmentProvider::copy_from_environment`]
//! returns an archive holding the requested path and
//! [`EnvironmentProvider::copy_to_environment`] unpacks an archive into a
//! directory.

mod docker;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::EnvironmentId;

pub use docker::DockerCli;

/// Errors reported by an environment provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The image, environment or path doesn't exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime rejected the request.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The runtime client couldn't be started or talked to.
    #[error("failed to run '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle state of an environment as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentState {
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Restarting.
    Restarting,
    /// Stopped.
    Exited,
    /// Being removed.
    Removing,
    /// Failed and unusable.
    Dead,
    /// Anything else the runtime reports.
    Other(String),
}

impl EnvironmentState {
    /// Parse the runtime's state string (`running`, `exited`, ...).
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => EnvironmentState::Created,
            "running" => EnvironmentState::Running,
            "paused" => EnvironmentState::Paused,
            "restarting" => EnvironmentState::Restarting,
            "exited" => EnvironmentState::Exited,
            "removing" => EnvironmentState::Removing,
            "dead" => EnvironmentState::Dead,
            other => EnvironmentState::Other(other.to_string()),
        }
    }

    /// Check if the environment has to be stopped before removal.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EnvironmentState::Running | EnvironmentState::Paused | EnvironmentState::Restarting
        )
    }
}

/// An existing environment found by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSummary {
    /// Runtime identifier.
    pub id: EnvironmentId,
    /// Environment name.
    pub name: String,
    /// Current state.
    pub state: EnvironmentState,
}

/// Result of running a command inside an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Check if the command exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Output stream a line of command output was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// Get the stream name (`stdout` or `stderr`).
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Receiver of command output while the command is still running.
pub trait OutputSink: Send + Sync {
    /// Called once per line, without the line terminator.
    fn line(&self, stream: OutputStream, line: &str);
}

/// Capability interface over a container runtime.
///
/// Implementations must be safe to share between the tasks of one run.
/// Dropping any returned future must abandon the underlying operation.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Check whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, ProviderError>;

    /// Pull `image` from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), ProviderError>;

    /// List environments, running or not, whose name is exactly `name`.
    async fn find_environments(&self, name: &str)
    -> Result<Vec<EnvironmentSummary>, ProviderError>;

    /// Create an environment from `image` running `keep_alive` as its entrypoint.
    async fn create_environment(
        &self,
        image: &str,
        keep_alive: &[String],
        name: &str,
    ) -> Result<EnvironmentId, ProviderError>;

    /// Start a created environment.
    async fn start_environment(&self, id: &EnvironmentId) -> Result<(), ProviderError>;

    /// Stop an environment, sending `signal` to its main process.
    async fn stop_environment(&self, id: &EnvironmentId, signal: &str)
    -> Result<(), ProviderError>;

    /// Remove a stopped environment.
    async fn remove_environment(&self, id: &EnvironmentId) -> Result<(), ProviderError>;

    /// Run `command` through `sh -c` and collect its output.
    ///
    /// Meant for short helper commands; task commands go through
    /// [`exec_streaming`](Self::exec_streaming).
    async fn exec(&self, id: &EnvironmentId, command: &str) -> Result<ExecOutput, ProviderError>;

    /// Run `command` through `sh -c`, handing each output line to `sink`
    /// as soon as it is written. Returns the exit code.
    async fn exec_streaming(
        &self,
        id: &EnvironmentId,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<i32, ProviderError>;

    /// Read `path` out of an environment as a tar archive.
    async fn copy_from_environment(
        &self,
        id: &EnvironmentId,
        path: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    /// Unpack a tar archive into `dest_dir` inside an environment.
    async fn copy_to_environment(
        &self,
        id: &EnvironmentId,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), ProviderError>;
}
