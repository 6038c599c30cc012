//! Testing utilities for users of the buildvault library.
//!
//! [`InMemoryProvider`] implements [`EnvironmentProvider`] without a
//! container runtime. Each environment owns an in-memory filesystem and
//! commands are interpreted by a small `sh` subset, so pipelines written
//! with `echo`, `cat`, `mkdir -p` and `grep -q` run unchanged. Every
//! provider call is recorded for ordering assertions and any operation can
//! be made to fail.
//!
//! # Example
//!
//! ```
//! use buildvault::testing::InMemoryProvider;
//!
//! # tokio_test_block(async {
//! let provider = InMemoryProvider::new();
//! let env = provider.spawn_environment("alpine").await;
//! provider.write_file(&env, "/data.txt", b"hello\n");
//! assert_eq!(provider.read_file(&env, "/data.txt").unwrap(), b"hello\n");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

mod shell;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::core::types::EnvironmentId;
use crate::provider::{
    EnvironmentProvider, EnvironmentState, EnvironmentSummary, ExecOutput, OutputSink,
    OutputStream, ProviderError,
};
use shell::FileSystem;

/// Provider operations, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ImageExists,
    PullImage,
    FindEnvironments,
    CreateEnvironment,
    StartEnvironment,
    StopEnvironment,
    RemoveEnvironment,
    Exec,
    CopyFrom,
    CopyTo,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    ImageExists(String),
    PullImage(String),
    FindEnvironments(String),
    CreateEnvironment { image: String, name: String },
    StartEnvironment(String),
    StopEnvironment { name: String, signal: String },
    RemoveEnvironment(String),
    Exec { name: String, command: String },
    CopyFrom { name: String, path: String },
    CopyTo { name: String, dest_dir: String },
}

impl ProviderCall {
    /// Get the operation this call performed.
    pub fn operation(&self) -> Operation {
        match self {
            ProviderCall::ImageExists(_) => Operation::ImageExists,
            ProviderCall::PullImage(_) => Operation::PullImage,
            ProviderCall::FindEnvironments(_) => Operation::FindEnvironments,
            ProviderCall::CreateEnvironment { .. } => Operation::CreateEnvironment,
            ProviderCall::StartEnvironment(_) => Operation::StartEnvironment,
            ProviderCall::StopEnvironment { .. } => Operation::StopEnvironment,
            ProviderCall::RemoveEnvironment(_) => Operation::RemoveEnvironment,
            ProviderCall::Exec { .. } => Operation::Exec,
            ProviderCall::CopyFrom { .. } => Operation::CopyFrom,
            ProviderCall::CopyTo { .. } => Operation::CopyTo,
        }
    }
}

#[derive(Debug)]
struct Environment {
    name: String,
    image: String,
    keep_alive: Vec<String>,
    state: EnvironmentState,
    fs: FileSystem,
    exec_log: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    operation: Operation,
    once: bool,
}

#[derive(Debug, Default)]
struct State {
    images: HashSet<String>,
    unpullable: HashSet<String>,
    workdirs: HashMap<String, String>,
    environments: BTreeMap<EnvironmentId, Environment>,
    calls: Vec<ProviderCall>,
    failures: Vec<Failure>,
    next_scratch: usize,
}

impl State {
    fn env(&self, id: &EnvironmentId) -> Result<&Environment, ProviderError> {
        self.environments
            .get(id)
            .ok_or_else(|| ProviderError::NotFound(format!("No such container: {}", id)))
    }

    fn env_mut(&mut self, id: &EnvironmentId) -> Result<&mut Environment, ProviderError> {
        self.environments
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(format!("No such container: {}", id)))
    }

    fn name_of(&self, id: &EnvironmentId) -> String {
        self.environments
            .get(id)
            .map(|env| env.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Consume a matching injected failure, if any.
    fn take_failure(&mut self, operation: Operation) -> Result<(), ProviderError> {
        let Some(idx) = self
            .failures
            .iter()
            .position(|f| f.operation == operation)
        else {
            return Ok(());
        };
        if self.failures[idx].once {
            self.failures.remove(idx);
        }
        Err(ProviderError::Runtime(format!(
            "injected {:?} failure",
            operation
        )))
    }

    fn insert(&mut self, name: String, image: &str, keep_alive: &[String], state: EnvironmentState) -> EnvironmentId {
        let id = EnvironmentId::new(Uuid::new_v4().simple().to_string());
        let fs = match self.workdirs.get(image) {
            Some(dir) => FileSystem::with_workdir(dir),
            None => FileSystem::new(),
        };
        self.environments.insert(
            id.clone(),
            Environment {
                name,
                image: image.to_string(),
                keep_alive: keep_alive.to_vec(),
                state,
                fs,
                exec_log: Vec::new(),
            },
        );
        id
    }
}

/// An [`EnvironmentProvider`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    exec_delay: Option<Duration>,
    execs_in_flight: AtomicUsize,
    max_execs_in_flight: AtomicUsize,
}

impl InMemoryProvider {
    /// Create a provider with no local images. Pulls succeed for any image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `image` as already present locally.
    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.state().images.insert(image.into());
        self
    }

    /// Make pulls of `image` fail with "not found".
    pub fn with_unpullable_image(self, image: impl Into<String>) -> Self {
        self.state().unpullable.insert(image.into());
        self
    }

    /// Run commands in environments created from `image` inside `dir`,
    /// like an image with a `WORKDIR`. Copies still resolve against `/`.
    pub fn with_workdir(self, image: impl Into<String>, dir: impl Into<String>) -> Self {
        self.state().workdirs.insert(image.into(), dir.into());
        self
    }

    /// Make every exec take at least `delay`.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `operation`.
    pub fn fail_next(&self, operation: Operation) {
        self.state().failures.push(Failure {
            operation,
            once: true,
        });
    }

    /// Fail every call of `operation` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, operation: Operation) {
        self.state().failures.push(Failure {
            operation,
            once: false,
        });
    }

    /// Drop all injected failures.
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Create and start an anonymous environment.
    pub async fn spawn_environment(&self, image: &str) -> EnvironmentId {
        let mut state = self.state();
        state.next_scratch += 1;
        let name = format!("scratch_{}", state.next_scratch);
        state.images.insert(image.to_string());
        state.insert(name, image, &[], EnvironmentState::Running)
    }

    /// Add an environment called `name` left behind by an earlier run.
    pub fn seed_environment(
        &self,
        name: &str,
        image: &str,
        state: EnvironmentState,
    ) -> EnvironmentId {
        self.state().insert(name.to_string(), image, &[], state)
    }

    /// Write a file into an environment, creating parent directories.
    ///
    /// # Panics
    ///
    /// Panics if the environment doesn't exist.
    pub fn write_file(&self, id: &EnvironmentId, path: &str, contents: &[u8]) {
        let mut state = self.state();
        let env = state
            .environments
            .get_mut(id)
            .unwrap_or_else(|| panic!("unknown environment {}", id));
        env.fs.write_creating_parents(path, contents);
    }

    /// Read a file from an environment.
    pub fn read_file(&self, id: &EnvironmentId, path: &str) -> Option<Vec<u8>> {
        let state = self.state();
        state.environments.get(id)?.fs.read(path).map(<[u8]>::to_vec)
    }

    /// Read a file from the environment called `name`.
    pub fn read_file_named(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        let id = self.environment_named(name)?;
        self.read_file(&id, path)
    }

    /// Commands executed in an environment, in order.
    pub fn exec_log(&self, id: &EnvironmentId) -> Vec<String> {
        self.state()
            .environments
            .get(id)
            .map(|env| env.exec_log.clone())
            .unwrap_or_default()
    }

    /// Find the environment called `name`.
    pub fn environment_named(&self, name: &str) -> Option<EnvironmentId> {
        self.state()
            .environments
            .iter()
            .find(|(_, env)| env.name == name)
            .map(|(id, _)| id.clone())
    }

    /// Get the state of an environment.
    pub fn environment_state(&self, id: &EnvironmentId) -> Option<EnvironmentState> {
        self.state().environments.get(id).map(|env| env.state.clone())
    }

    /// Get the image and keep-alive command an environment was created with.
    pub fn environment_setup(&self, id: &EnvironmentId) -> Option<(String, Vec<String>)> {
        self.state()
            .environments
            .get(id)
            .map(|env| (env.image.clone(), env.keep_alive.clone()))
    }

    /// Names of all environments that currently exist.
    pub fn environment_names(&self) -> Vec<String> {
        self.state()
            .environments
            .values()
            .map(|env| env.name.clone())
            .collect()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    /// Count calls of `operation`.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    /// Every executed command with the name of its environment, in order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Exec { name, command } => Some((name.clone(), command.clone())),
                _ => None,
            })
            .collect()
    }

    /// Highest number of execs that ran at the same time.
    pub fn max_concurrent_execs(&self) -> usize {
        self.max_execs_in_flight.load(Ordering::SeqCst)
    }

    async fn run_command(
        &self,
        id: &EnvironmentId,
        command: &str,
    ) -> Result<ExecOutput, ProviderError> {
        {
            let mut state = self.state();
            let name = state.name_of(id);
            state.calls.push(ProviderCall::Exec {
                name,
                command: command.to_string(),
            });
            state.take_failure(Operation::Exec)?;
            let env = state.env(id)?;
            if env.state != EnvironmentState::Running {
                return Err(ProviderError::Runtime(format!(
                    "container {} is not running",
                    id
                )));
            }
        }

        let in_flight = self.execs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_execs_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        self.execs_in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state();
        let env = state.env_mut(id)?;
        env.exec_log.push(command.to_string());
        let out = shell::run(&mut env.fs, command);
        Ok(ExecOutput {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

/// An [`OutputSink`] that keeps every line it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<(OutputStream, String)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line received so far, in order.
    pub fn lines(&self) -> Vec<(OutputStream, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Lines received on `stream`, in order.
    pub fn lines_of(&self, stream: OutputStream) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, line)| line)
            .collect()
    }
}

impl OutputSink for CollectingSink {
    fn line(&self, stream: OutputStream, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stream, line.to_string()));
    }
}

fn output_lines(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    text.lines().map(str::to_string).collect()
}

#[async_trait]
impl EnvironmentProvider for InMemoryProvider {
    async fn image_exists(&self, image: &str) -> Result<bool, ProviderError> {
        let mut state = self.state();
        state.calls.push(ProviderCall::ImageExists(image.to_string()));
        state.take_failure(Operation::ImageExists)?;
        Ok(state.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(ProviderCall::PullImage(image.to_string()));
        state.take_failure(Operation::PullImage)?;
        if state.unpullable.contains(image) {
            return Err(ProviderError::NotFound(format!(
                "manifest for {} not found",
                image
            )));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn find_environments(
        &self,
        name: &str,
    ) -> Result<Vec<EnvironmentSummary>, ProviderError> {
        let mut state = self.state();
        state
            .calls
            .push(ProviderCall::FindEnvironments(name.to_string()));
        state.take_failure(Operation::FindEnvironments)?;
        Ok(state
            .environments
            .iter()
            .filter(|(_, env)| env.name == name)
            .map(|(id, env)| EnvironmentSummary {
                id: id.clone(),
                name: env.name.clone(),
                state: env.state.clone(),
            })
            .collect())
    }

    async fn create_environment(
        &self,
        image: &str,
        keep_alive: &[String],
        name: &str,
    ) -> Result<EnvironmentId, ProviderError> {
        let mut state = self.state();
        state.calls.push(ProviderCall::CreateEnvironment {
            image: image.to_string(),
            name: name.to_string(),
        });
        state.take_failure(Operation::CreateEnvironment)?;

        if !state.images.contains(image) {
            return Err(ProviderError::NotFound(format!("No such image: {}", image)));
        }
        if state.environments.values().any(|env| env.name == name) {
            return Err(ProviderError::Runtime(format!(
                "Conflict. The container name \"/{}\" is already in use",
                name
            )));
        }
        Ok(state.insert(name.to_string(), image, keep_alive, EnvironmentState::Created))
    }

    async fn start_environment(&self, id: &EnvironmentId) -> Result<(), ProviderError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(ProviderCall::StartEnvironment(name));
        state.take_failure(Operation::StartEnvironment)?;
        state.env_mut(id)?.state = EnvironmentState::Running;
        Ok(())
    }

    async fn stop_environment(
        &self,
        id: &EnvironmentId,
        signal: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(ProviderCall::StopEnvironment {
            name,
            signal: signal.to_string(),
        });
        state.take_failure(Operation::StopEnvironment)?;
        state.env_mut(id)?.state = EnvironmentState::Exited;
        Ok(())
    }

    async fn remove_environment(&self, id: &EnvironmentId) -> Result<(), ProviderError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(ProviderCall::RemoveEnvironment(name));
        state.take_failure(Operation::RemoveEnvironment)?;
        if state.env(id)?.state.is_running() {
            return Err(ProviderError::Runtime(format!(
                "cannot remove running container {}",
                id
            )));
        }
        state.environments.remove(id);
        Ok(())
    }

    async fn exec(&self, id: &EnvironmentId, command: &str) -> Result<ExecOutput, ProviderError> {
        self.run_command(id, command).await
    }

    async fn exec_streaming(
        &self,
        id: &EnvironmentId,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<i32, ProviderError> {
        let out = self.run_command(id, command).await?;
        for line in output_lines(&out.stdout) {
            sink.line(OutputStream::Stdout, &line);
        }
        for line in output_lines(&out.stderr) {
            sink.line(OutputStream::Stderr, &line);
        }
        Ok(out.exit_code)
    }

    async fn copy_from_environment(
        &self,
        id: &EnvironmentId,
        path: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(ProviderCall::CopyFrom {
            name,
            path: path.to_string(),
        });
        state.take_failure(Operation::CopyFrom)?;

        let env = state.env(id)?;
        let normalized = shell::normalize(path);
        let base = normalized.rsplit('/').next().unwrap_or_default();

        let mut builder = tar::Builder::new(Vec::new());
        if let Some(contents) = env.fs.read(&normalized) {
            append_file(&mut builder, base, contents)?;
        } else if env.fs.is_dir(&normalized) {
            let root = if base.is_empty() { "." } else { base };
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            builder
                .append_data(&mut header, format!("{}/", root), std::io::empty())
                .map_err(archive_error)?;
            for (rel, contents) in env.fs.files_under(&normalized) {
                append_file(&mut builder, &format!("{}/{}", root, rel), &contents)?;
            }
        } else {
            return Err(ProviderError::NotFound(format!(
                "Could not find the file {} in container {}",
                path, env.name
            )));
        }

        builder.into_inner().map_err(archive_error)
    }

    async fn copy_to_environment(
        &self,
        id: &EnvironmentId,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(ProviderCall::CopyTo {
            name,
            dest_dir: dest_dir.to_string(),
        });
        state.take_failure(Operation::CopyTo)?;

        let env = state.env_mut(id)?;
        let dest = shell::normalize(dest_dir);
        if !env.fs.is_dir(&dest) {
            return Err(ProviderError::NotFound(format!(
                "Could not find the file {} in container {}",
                dest_dir, env.name
            )));
        }

        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries().map_err(archive_error)? {
            let mut entry = entry.map_err(archive_error)?;
            let rel = entry
                .path()
                .map_err(archive_error)?
                .to_string_lossy()
                .to_string();
            let target = format!("{}/{}", dest, rel);

            if entry.header().entry_type().is_dir() {
                env.fs.create_dir_all(&target);
            } else if entry.header().entry_type().is_file() {
                let mut contents = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut contents).map_err(archive_error)?;
                env.fs.write_creating_parents(&target, &contents);
            }
        }
        Ok(())
    }
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    contents: &[u8],
) -> Result<(), ProviderError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, name, contents)
        .map_err(archive_error)
}

fn archive_error(e: std::io::Error) -> ProviderError {
    ProviderError::Runtime(format!("archive error: {}", e))
}
