//! Deterministic task fingerprints and environment names.
//!
//! A fingerprint hashes a task's name, base image, input mappings and
//! commands, plus the name and artifact list of each dependency. It does not
//! include the upstream task's own fingerprint: changing an upstream task's
//! commands leaves the downstream fingerprint unchanged. Inputs are hashed
//! by path only, so editing a host file keeps the fingerprint.
//!
//! Every field is written length-prefixed so that, for example, commands
//! `["ab", "c"]` and `["a", "bc"]` hash differently.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::task::Task;

/// Number of hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Content hash identifying a task definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a task definition.
    pub fn of(task: &Task) -> Self {
        let mut hasher = Sha256::new();

        write_field(&mut hasher, task.name());
        write_field(&mut hasher, task.base_image());

        write_len(&mut hasher, task.inputs().len());
        for input in task.inputs() {
            write_field(&mut hasher, &input.from.to_string_lossy());
            write_field(&mut hasher, &input.to);
        }

        write_len(&mut hasher, task.commands().len());
        for command in task.commands() {
            write_field(&mut hasher, command);
        }

        write_len(&mut hasher, task.dependencies().len());
        for dependency in task.dependencies() {
            write_field(&mut hasher, dependency.task().name());
            write_len(&mut hasher, dependency.artifacts().len());
            for artifact in dependency.artifacts() {
                write_field(&mut hasher, &artifact.from);
                write_field(&mut hasher, &artifact.to);
            }
        }

        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..FINGERPRINT_LEN].to_string())
    }

    /// Get the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the fingerprint of a task definition.
pub fn fingerprint(task: &Task) -> Fingerprint {
    Fingerprint::of(task)
}

/// Deterministic environment name: `<prefix>_<task-name>_<fingerprint>`.
pub fn environment_name(prefix: &str, task: &Task, fingerprint: &Fingerprint) -> String {
    format!("{}_{}_{}", prefix, task.name(), fingerprint)
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_field(hasher: &mut Sha256, value: &str) {
    write_len(hasher, value.len());
    hasher.update(value.as_bytes());
}
