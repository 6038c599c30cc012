//! Task graph executor.
//!
//! The `Executor` runs a task and, depth-first, everything it depends on.
//! Each task gets a fresh environment named after its fingerprint:
//!
//! 1. Reclaim any environment left over with the same name
//! 2. Pull the base image if it isn't present
//! 3. Create and start the environment
//! 4. Copy host inputs in
//! 5. Execute every dependency, then copy their artifacts in
//! 6. Run the commands in order, stopping at the first failure
//! 7. Copy declared outputs onto the host
//! 8. Stop the environment (it is not removed)

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::dag;
use crate::core::fingerprint::{Fingerprint, environment_name};
use crate::core::task::{Dependency, ProvisionStage, Task, TaskError};
use crate::core::types::{EnvironmentId, RunId};
use crate::provider::{EnvironmentProvider, OutputSink, OutputStream, ProviderError};
use crate::transfer::{self, TransferError};

use super::run::{RunReport, RunState, TaskResult};

/// Logs command output inside the current task span.
struct LogSink;

impl OutputSink for LogSink {
    fn line(&self, stream: OutputStream, line: &str) {
        info!(stream = stream.as_str(), "{}", line);
    }
}

/// Default environment name prefix.
pub const DEFAULT_PREFIX: &str = "buildvault";

/// Default signal used to stop environments.
pub const DEFAULT_STOP_SIGNAL: &str = "SIGKILL";

/// Settings for an [`Executor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Prefix of every environment name.
    pub prefix: String,
    /// Entrypoint that keeps an environment alive between execs.
    pub keep_alive: Vec<String>,
    /// Signal sent when stopping an environment.
    pub stop_signal: String,
    /// How many sibling dependencies may execute at once. `1` is sequential.
    pub concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            keep_alive: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            stop_signal: DEFAULT_STOP_SIGNAL.to_string(),
            concurrency: 1,
        }
    }
}

impl ExecutorConfig {
    /// Set the environment name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the dependency fan-out. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the stop signal.
    pub fn with_stop_signal(mut self, signal: impl Into<String>) -> Self {
        self.stop_signal = signal.into();
        self
    }

    /// Set the keep-alive entrypoint.
    pub fn with_keep_alive<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_alive = command.into_iter().map(Into::into).collect();
        self
    }
}

/// Executor for task graphs.
///
/// Holds no per-run state, so one executor can serve several runs one after
/// another. Runs sharing task definitions must not overlap: they would
/// reclaim each other's environments.
pub struct Executor {
    provider: Arc<dyn EnvironmentProvider>,
    config: ExecutorConfig,
}

impl Executor {
    /// Create an executor with default settings.
    pub fn new(provider: Arc<dyn EnvironmentProvider>) -> Self {
        Self::with_config(provider, ExecutorConfig::default())
    }

    /// Create an executor with the given settings.
    pub fn with_config(provider: Arc<dyn EnvironmentProvider>, config: ExecutorConfig) -> Self {
        Self { provider, config }
    }

    /// Get the executor settings.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Name of the environment `task` runs in.
    pub fn environment_name(&self, task: &Task) -> String {
        environment_name(&self.config.prefix, task, &Fingerprint::of(task))
    }

    /// Execute `task` after everything it depends on.
    ///
    /// The graph is validated before the provider is called at all. The
    /// first error aborts the run; environments that were already created
    /// are left as they are.
    pub async fn execute(&self, task: &Arc<Task>) -> Result<RunReport, TaskError> {
        let state = RunState::new();
        let run_id = RunId::new();
        let started = Instant::now();

        let span = info_span!("run", run = %run_id, task = %task.name());
        async {
            dag::validate(task)?;
            debug!(concurrency = self.config.concurrency, "task graph is valid");
            self.run_task(task, &state).await?;
            Ok::<(), TaskError>(())
        }
        .instrument(span)
        .await?;

        let duration = started.elapsed();
        info!(run = %run_id, task = %task.name(), ?duration, "run completed");
        Ok(state.into_report(run_id, duration))
    }

    /// Execute `task` within an existing run, reusing its result if it
    /// already ran.
    pub fn run_task<'a>(
        &'a self,
        task: &'a Arc<Task>,
        state: &'a RunState,
    ) -> BoxFuture<'a, Result<TaskResult, TaskError>> {
        Box::pin(async move {
            let fingerprint = Fingerprint::of(task);
            let cell = state.cell(&fingerprint);

            if let Some(done) = cell.get() {
                debug!(task = %task.name(), "reusing environment from this run");
                return Ok(done.clone());
            }

            let span = info_span!("task", task = %task.name(), fingerprint = %fingerprint);
            cell.get_or_try_init(|| {
                self.execute_task(task, &fingerprint, state)
                    .instrument(span)
            })
            .await
            .cloned()
        })
    }

    async fn execute_task(
        &self,
        task: &Arc<Task>,
        fingerprint: &Fingerprint,
        state: &RunState,
    ) -> Result<TaskResult, TaskError> {
        let started = Instant::now();
        let name = environment_name(&self.config.prefix, task, fingerprint);
        info!(environment = %name, "starting task");

        self.reclaim(task, &name).await?;
        self.ensure_image(task).await?;
        let id = self.create_environment(task, &name).await?;
        state.record_environment(fingerprint, id.clone());

        self.copy_inputs(task, &id).await?;
        let upstream = self.execute_dependencies(task, state).await?;
        self.copy_artifacts(task, &id, &upstream).await?;
        self.run_commands(task, &id).await?;
        self.capture_outputs(task, &id).await?;

        self.provider
            .stop_environment(&id, &self.config.stop_signal)
            .await
            .map_err(|e| provisioning(task, ProvisionStage::Stop, e))?;

        let result = TaskResult {
            task: task.name().to_string(),
            fingerprint: fingerprint.clone(),
            environment_name: name,
            environment_id: id,
            duration: started.elapsed(),
        };
        info!(duration = ?result.duration, "task completed");
        state.record_completed(result.clone());
        Ok(result)
    }

    /// Remove environments left over under `name`.
    ///
    /// Only the lookup is fatal. A stale environment that can't be removed
    /// surfaces later as a create conflict.
    async fn reclaim(&self, task: &Task, name: &str) -> Result<(), TaskError> {
        let existing = self
            .provider
            .find_environments(name)
            .await
            .map_err(|e| provisioning(task, ProvisionStage::Lookup, e))?;

        for env in existing {
            debug!(environment = %env.name, id = %env.id.short(), state = ?env.state, "reclaiming environment");

            if env.state.is_running()
                && let Err(e) = self
                    .provider
                    .stop_environment(&env.id, &self.config.stop_signal)
                    .await
            {
                warn!(environment = %env.name, error = %e, "failed to stop stale environment");
            }

            if let Err(e) = self.provider.remove_environment(&env.id).await {
                warn!(environment = %env.name, error = %e, "failed to remove stale environment");
            }
        }
        Ok(())
    }

    async fn ensure_image(&self, task: &Task) -> Result<(), TaskError> {
        let image = task.base_image();
        let present = self
            .provider
            .image_exists(image)
            .await
            .map_err(|e| provisioning(task, ProvisionStage::PullImage, e))?;

        if present {
            debug!(image = %image, "image present locally");
            return Ok(());
        }

        info!(image = %image, "pulling image");
        self.provider
            .pull_image(image)
            .await
            .map_err(|e| provisioning(task, ProvisionStage::PullImage, e))
    }

    async fn create_environment(&self, task: &Task, name: &str) -> Result<EnvironmentId, TaskError> {
        let id = self
            .provider
            .create_environment(task.base_image(), &self.config.keep_alive, name)
            .await
            .map_err(|e| provisioning(task, ProvisionStage::Create, e))?;

        self.provider
            .start_environment(&id)
            .await
            .map_err(|e| provisioning(task, ProvisionStage::Start, e))?;

        debug!(environment = %name, id = %id.short(), "environment started");
        Ok(id)
    }

    /// Execute every dependency of `task`, returning results in declared order.
    async fn execute_dependencies(
        &self,
        task: &Task,
        state: &RunState,
    ) -> Result<Vec<TaskResult>, TaskError> {
        if task.dependencies().is_empty() {
            return Ok(Vec::new());
        }

        // Built up front: a lazily mapped stream of borrowed dependencies
        // isn't provably `Send` inside the boxed `run_task` future.
        let pending: Vec<BoxFuture<'_, Result<TaskResult, TaskError>>> = task
            .dependencies()
            .iter()
            .map(|dependency| self.execute_dependency(task, dependency, state).boxed())
            .collect();

        stream::iter(pending)
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }

    async fn execute_dependency(
        &self,
        task: &Task,
        dependency: &Dependency,
        state: &RunState,
    ) -> Result<TaskResult, TaskError> {
        self.run_task(dependency.task(), state)
            .await
            .map_err(|e| TaskError::Dependency {
                task: task.name().to_string(),
                dependency: dependency.task().name().to_string(),
                source: Box::new(e),
            })
    }

    async fn copy_inputs(&self, task: &Task, dest: &EnvironmentId) -> Result<(), TaskError> {
        for input in task.inputs() {
            debug!(from = %input.from.display(), to = %input.to, "copying input");
            transfer::copy_from_host(self.provider.as_ref(), dest, &input.from, &input.to)
                .await
                .map_err(|source| TaskError::Transfer {
                    task: task.name().to_string(),
                    from: input.from.display().to_string(),
                    to: input.to.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn copy_artifacts(
        &self,
        task: &Task,
        dest: &EnvironmentId,
        upstream: &[TaskResult],
    ) -> Result<(), TaskError> {
        for (dependency, result) in task.dependencies().iter().zip(upstream) {
            for artifact in dependency.artifacts() {
                debug!(
                    dependency = %dependency.task().name(),
                    from = %artifact.from,
                    to = %artifact.to,
                    "copying artifact"
                );
                transfer::copy_artifact(
                    self.provider.as_ref(),
                    &result.environment_id,
                    dest,
                    &artifact.from,
                    &artifact.to,
                )
                .await
                .map_err(|source| TaskError::Transfer {
                    task: task.name().to_string(),
                    from: artifact.from.clone(),
                    to: artifact.to.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    async fn run_commands(&self, task: &Task, id: &EnvironmentId) -> Result<(), TaskError> {
        for command in task.commands() {
            info!(command = %command, "running command");

            let exit_code = self
                .provider
                .exec_streaming(id, command, &LogSink)
                .await
                .map_err(|source| TaskError::CommandExec {
                    task: task.name().to_string(),
                    command: command.clone(),
                    source,
                })?;

            if exit_code != 0 {
                return Err(TaskError::Command {
                    task: task.name().to_string(),
                    command: command.clone(),
                    exit_code,
                });
            }
        }
        Ok(())
    }

    async fn capture_outputs(&self, task: &Task, id: &EnvironmentId) -> Result<(), TaskError> {
        for output in task.outputs() {
            let dest = Path::new(output)
                .file_name()
                .map(|file_name| task.artifacts_dir().join(file_name));

            let result = match &dest {
                Some(dest) => {
                    info!(output = %output, dest = %dest.display(), "capturing output");
                    transfer::extract_to_host(self.provider.as_ref(), id, output, dest).await
                }
                None => Err(TransferError::InvalidDestination {
                    path: output.clone(),
                }),
            };

            result.map_err(|source| TaskError::Transfer {
                task: task.name().to_string(),
                from: output.clone(),
                to: dest
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
                source,
            })?;
        }
        Ok(())
    }
}

fn provisioning(task: &Task, stage: ProvisionStage, source: ProviderError) -> TaskError {
    TaskError::Provisioning {
        task: task.name().to_string(),
        stage,
        source,
    }
}
