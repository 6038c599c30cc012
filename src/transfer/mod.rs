//! Artifact transfer between environments, from the host and onto the host.
//!
//! Providers hand out files as tar archives. An artifact names exactly one
//! file: the first regular-file entry of the archive is used and directory
//! entries are skipped. Copying directory trees is not supported.
//!
//! Relative destinations resolve against the working directory commands
//! run in, found with `pwd`, since archive copies resolve against `/`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::debug;

use crate::core::types::EnvironmentId;
use crate::provider::{EnvironmentProvider, ProviderError};

/// Errors that can occur while moving an artifact.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The source path doesn't exist in the source environment.
    #[error("source path '{path}' not found: {source}")]
    SourceMissing {
        path: String,
        #[source]
        source: ProviderError,
    },

    /// Reading from the source environment failed.
    #[error("failed to read '{path}' from source environment: {source}")]
    Read {
        path: String,
        #[source]
        source: ProviderError,
    },

    /// The archive stream couldn't be decoded.
    #[error("archive for '{path}' is corrupt or truncated: {source}")]
    CorruptArchive {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The archive held no regular file.
    #[error("archive for '{path}' contains no regular file")]
    NoRegularFile { path: String },

    /// The destination path has no file name.
    #[error("invalid destination path '{path}'")]
    InvalidDestination { path: String },

    /// The destination directory couldn't be created inside the environment.
    #[error("failed to create directory '{path}': {reason}")]
    CreateDirectory { path: String, reason: String },

    /// The working directory of the destination environment couldn't be found.
    #[error("failed to resolve working directory: {reason}")]
    WorkingDirectory { reason: String },

    /// Writing into the destination environment failed.
    #[error("failed to write '{path}' into destination environment: {source}")]
    Write {
        path: String,
        #[source]
        source: ProviderError,
    },

    /// Reading a file from the host filesystem failed.
    #[error("failed to read '{}': {source}", .path.display())]
    HostRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing onto the host filesystem failed.
    #[error("failed to write '{}': {source}", .path.display())]
    HostIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single file read out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    /// File contents.
    pub contents: Vec<u8>,
    /// Unix permission bits.
    pub mode: u32,
    /// Modification time in seconds since the epoch.
    pub mtime: u64,
}

/// Copy `from` in the source environment to `to` in the destination environment.
///
/// The destination directory is created first. A relative `to` lands in
/// the destination's working directory. The file is renamed to the last
/// component of `to`.
pub async fn copy_artifact(
    provider: &dyn EnvironmentProvider,
    source_env: &EnvironmentId,
    dest_env: &EnvironmentId,
    from: &str,
    to: &str,
) -> Result<(), TransferError> {
    debug!(
        source = %source_env.short(),
        dest = %dest_env.short(),
        from = %from,
        to = %to,
        "copying artifact"
    );

    let archive = read_archive(provider, source_env, from).await?;
    let file = first_regular_file(&archive, from)?;
    deliver(provider, dest_env, &file, to).await
}

/// Copy the host file `from` to `to` in an environment.
///
/// Permission bits and modification time are kept. `to` resolves the
/// same way as in [`copy_artifact`].
pub async fn copy_from_host(
    provider: &dyn EnvironmentProvider,
    dest_env: &EnvironmentId,
    from: &Path,
    to: &str,
) -> Result<(), TransferError> {
    debug!(dest = %dest_env.short(), from = %from.display(), to = %to, "copying host file");

    let host_read = |source| TransferError::HostRead {
        path: from.to_path_buf(),
        source,
    };

    let metadata = tokio::fs::metadata(from).await.map_err(host_read)?;
    if !metadata.is_file() {
        return Err(host_read(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    let contents = tokio::fs::read(from).await.map_err(host_read)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());

    let file = ArchivedFile {
        contents,
        mode: host_mode(&metadata),
        mtime,
    };
    deliver(provider, dest_env, &file, to).await
}

#[cfg(unix)]
fn host_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn host_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Write `file` to `to` inside an environment.
async fn deliver(
    provider: &dyn EnvironmentProvider,
    dest_env: &EnvironmentId,
    file: &ArchivedFile,
    to: &str,
) -> Result<(), TransferError> {
    let (dir, file_name) = split_container_path(to)?;
    let dir = destination_directory(provider, dest_env, dir).await?;

    let repacked = pack_file(file_name, file).map_err(|source| TransferError::CorruptArchive {
        path: to.to_string(),
        source,
    })?;

    provider
        .copy_to_environment(dest_env, &dir, repacked)
        .await
        .map_err(|source| TransferError::Write {
            path: to.to_string(),
            source,
        })
}

/// Copy `from` out of an environment into `dest` on the host.
///
/// Parent directories of `dest` are created and an existing file is
/// overwritten.
pub async fn extract_to_host(
    provider: &dyn EnvironmentProvider,
    source_env: &EnvironmentId,
    from: &str,
    dest: &Path,
) -> Result<(), TransferError> {
    debug!(source = %source_env.short(), from = %from, dest = %dest.display(), "extracting artifact");

    let archive = read_archive(provider, source_env, from).await?;
    let file = first_regular_file(&archive, from)?;
    write_host_file(dest, &file.contents).await
}

/// Return the first regular file in a tar archive.
pub fn first_regular_file(archive: &[u8], path: &str) -> Result<ArchivedFile, TransferError> {
    let corrupt = |source| TransferError::CorruptArchive {
        path: path.to_string(),
        source,
    };

    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let mode = entry.header().mode().unwrap_or(0o644);
        let mtime = entry.header().mtime().unwrap_or(0);
        let expected = entry.size();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(corrupt)?;
        if contents.len() as u64 != expected {
            return Err(corrupt(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, got {}", expected, contents.len()),
            )));
        }

        return Ok(ArchivedFile {
            contents,
            mode,
            mtime,
        });
    }

    Err(TransferError::NoRegularFile {
        path: path.to_string(),
    })
}

/// Build a tar archive holding one file called `file_name`.
pub fn pack_file(file_name: &str, file: &ArchivedFile) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(file.contents.len() as u64);
    header.set_mode(file.mode);
    header.set_mtime(file.mtime);
    header.set_entry_type(tar::EntryType::Regular);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, file.contents.as_slice())?;
    builder.into_inner()
}

/// Split a container path into its directory and file name.
///
/// Mirrors `dirname`: `x.txt` lives in `.`, `/x.txt` in `/`.
pub fn split_container_path(path: &str) -> Result<(&str, &str), TransferError> {
    let invalid = || TransferError::InvalidDestination {
        path: path.to_string(),
    };

    let (dir, name) = match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", path),
    };

    if name.is_empty() || name == "." || name == ".." {
        return Err(invalid());
    }
    Ok((dir, name))
}

/// Quote a value for use as a single `sh` word.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

async fn read_archive(
    provider: &dyn EnvironmentProvider,
    env: &EnvironmentId,
    path: &str,
) -> Result<Vec<u8>, TransferError> {
    provider
        .copy_from_environment(env, path)
        .await
        .map_err(|source| match source {
            ProviderError::NotFound(_) => TransferError::SourceMissing {
                path: path.to_string(),
                source,
            },
            other => TransferError::Read {
                path: path.to_string(),
                source: other,
            },
        })
}

/// Turn `dir` into an absolute, existing directory inside `env`.
async fn destination_directory(
    provider: &dyn EnvironmentProvider,
    env: &EnvironmentId,
    dir: &str,
) -> Result<String, TransferError> {
    if dir.starts_with('/') {
        ensure_directory(provider, env, dir).await?;
        return Ok(dir.to_string());
    }

    let workdir = working_directory(provider, env).await?;
    if dir == "." {
        return Ok(workdir);
    }
    let joined = format!("{}/{}", workdir.trim_end_matches('/'), dir);
    ensure_directory(provider, env, &joined).await?;
    Ok(joined)
}

async fn working_directory(
    provider: &dyn EnvironmentProvider,
    env: &EnvironmentId,
) -> Result<String, TransferError> {
    let output = provider
        .exec(env, "pwd")
        .await
        .map_err(|e| TransferError::WorkingDirectory {
            reason: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.success() || !stdout.starts_with('/') {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TransferError::WorkingDirectory {
            reason: format!("pwd exited with code {}: {}{}", output.exit_code, stdout, stderr),
        });
    }
    Ok(stdout)
}

async fn ensure_directory(
    provider: &dyn EnvironmentProvider,
    env: &EnvironmentId,
    dir: &str,
) -> Result<(), TransferError> {
    let command = format!("mkdir -p {}", shell_quote(dir));
    let output = provider
        .exec(env, &command)
        .await
        .map_err(|e| TransferError::CreateDirectory {
            path: dir.to_string(),
            reason: e.to_string(),
        })?;

    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TransferError::CreateDirectory {
            path: dir.to_string(),
            reason: format!("mkdir exited with code {}: {}", output.exit_code, stderr),
        });
    }
    Ok(())
}

async fn write_host_file(dest: &Path, contents: &[u8]) -> Result<(), TransferError> {
    let host_io = |source| TransferError::HostIo {
        path: dest.to_path_buf(),
        source,
    };

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(host_io)?;
    }
    tokio::fs::write(dest, contents).await.map_err(host_io)
}
