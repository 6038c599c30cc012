//! Environment provider backed by the `docker` command-line client.
//!
//! Each operation runs one `docker` subcommand through
//! [`tokio::process::Command`]. Any CLI with the same surface (for example
//! `podman`) can be used through [`DockerCli::with_program`].
//!
//! Child processes are spawned with `kill_on_drop`, so dropping an in-flight
//! operation (a caller-side timeout or Ctrl+C) terminates the client process.
//! Task commands stream their output line by line instead of buffering it.

use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{
    EnvironmentProvider, EnvironmentState, EnvironmentSummary, ExecOutput, OutputSink,
    OutputStream, ProviderError,
};
use crate::core::types::EnvironmentId;

/// Provider that shells out to a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    /// Use the `docker` binary found on `PATH`.
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Use a specific client binary, e.g. `podman` or an absolute path.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Get the client binary.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the client with `args`, optionally feeding `input` on stdin.
    async fn run(&self, args: &[&str], input: Option<Vec<u8>>) -> Result<Output, ProviderError> {
        debug!(program = %self.program, args = ?args, "running runtime client");

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.io_error(e))?;
        let stdin = child.stdin.take();

        let write_input = async move {
            if let (Some(mut pipe), Some(data)) = (stdin, input) {
                pipe.write_all(&data).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (written, output) = tokio::join!(write_input, child.wait_with_output());
        let output = output.map_err(|e| self.io_error(e))?;
        written.map_err(|e| self.io_error(e))?;

        Ok(output)
    }

    /// Run the client and fail unless it exits successfully.
    async fn run_checked(
        &self,
        args: &[&str],
        input: Option<Vec<u8>>,
    ) -> Result<Output, ProviderError> {
        let output = self.run(args, input).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify_failure(&output))
        }
    }

    fn io_error(&self, source: std::io::Error) -> ProviderError {
        ProviderError::Io {
            program: self.program.clone(),
            source,
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvironmentProvider for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool, ProviderError> {
        let output = self
            .run(&["image", "inspect", "--format", "{{.Id}}", image], None)
            .await?;

        if output.status.success() {
            return Ok(true);
        }
        match classify_failure(&output) {
            ProviderError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ProviderError> {
        let output = self.run_checked(&["pull", image], None).await?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(image = %image, "{}", line);
        }
        Ok(())
    }

    async fn find_environments(
        &self,
        name: &str,
    ) -> Result<Vec<EnvironmentSummary>, ProviderError> {
        let filter = format!("name={}", name);
        let output = self
            .run_checked(
                &[
                    "ps",
                    "--all",
                    "--no-trunc",
                    "--filter",
                    &filter,
                    "--format",
                    "{{.ID}}\t{{.Names}}\t{{.State}}",
                ],
                None,
            )
            .await?;

        // The name filter matches substrings, keep exact matches only.
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|summary| summary.name == name)
            .collect())
    }

    async fn create_environment(
        &self,
        image: &str,
        keep_alive: &[String],
        name: &str,
    ) -> Result<EnvironmentId, ProviderError> {
        let mut args = vec!["create", "--init", "--tty", "--name", name, image];
        args.extend(keep_alive.iter().map(String::as_str));

        let output = self.run_checked(&args, None).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(ProviderError::Runtime(format!(
                "no environment id returned for '{}'",
                name
            )));
        }
        Ok(EnvironmentId::new(id))
    }

    async fn start_environment(&self, id: &EnvironmentId) -> Result<(), ProviderError> {
        self.run_checked(&["start", id.as_str()], None).await?;
        Ok(())
    }

    async fn stop_environment(
        &self,
        id: &EnvironmentId,
        signal: &str,
    ) -> Result<(), ProviderError> {
        self.run_checked(&["stop", "--signal", signal, id.as_str()], None)
            .await?;
        Ok(())
    }

    async fn remove_environment(&self, id: &EnvironmentId) -> Result<(), ProviderError> {
        self.run_checked(&["rm", id.as_str()], None).await?;
        Ok(())
    }

    async fn exec(&self, id: &EnvironmentId, command: &str) -> Result<ExecOutput, ProviderError> {
        let output = self
            .run(&["exec", id.as_str(), "sh", "-c", command], None)
            .await?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn exec_streaming(
        &self,
        id: &EnvironmentId,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<i32, ProviderError> {
        let args = ["exec", id.as_str(), "sh", "-c", command];
        debug!(program = %self.program, args = ?args, "running runtime client");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.io_error(e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err) = tokio::join!(
            forward_lines(stdout, OutputStream::Stdout, sink),
            forward_lines(stderr, OutputStream::Stderr, sink),
        );
        out.map_err(|e| self.io_error(e))?;
        err.map_err(|e| self.io_error(e))?;

        let status = child.wait().await.map_err(|e| self.io_error(e))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn copy_from_environment(
        &self,
        id: &EnvironmentId,
        path: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let source = format!("{}:{}", id.as_str(), path);
        let output = self.run_checked(&["cp", &source, "-"], None).await?;
        Ok(output.stdout)
    }

    async fn copy_to_environment(
        &self,
        id: &EnvironmentId,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let dest = format!("{}:{}", id.as_str(), dest_dir);
        self.run_checked(&["cp", "-", &dest], Some(archive)).await?;
        Ok(())
    }
}

/// Hand every line read from `reader` to `sink` as it arrives.
///
/// Bytes that aren't valid UTF-8 are replaced; a trailing `\r` is dropped.
async fn forward_lines<R>(
    reader: Option<R>,
    stream: OutputStream,
    sink: &dyn OutputSink,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };

    let mut segments = BufReader::new(reader).split(b'\n');
    while let Some(segment) = segments.next_segment().await? {
        let line = String::from_utf8_lossy(&segment);
        sink.line(stream, line.strip_suffix('\r').unwrap_or(&*line));
    }
    Ok(())
}

/// Turn a failed client invocation into a provider error.
fn classify_failure(output: &Output) -> ProviderError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    };

    let lower = message.to_ascii_lowercase();
    if lower.contains("no such") || lower.contains("could not find") || lower.contains("not found")
    {
        ProviderError::NotFound(message)
    } else {
        ProviderError::Runtime(message)
    }
}

/// Parse `ID<TAB>NAMES<TAB>STATE` lines from `docker ps`.
fn parse_ps_output(stdout: &str) -> Vec<EnvironmentSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let name = fields.next()?.trim();
            let state = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            Some(EnvironmentSummary {
                id: EnvironmentId::new(id),
                name: name.trim_start_matches('/').to_string(),
                state: EnvironmentState::parse(state),
            })
        })
        .collect()
}
