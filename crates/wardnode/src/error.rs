//! Error types for wardnode.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or does not match the schema.
    #[error("invalid TOML: {0}")]
    Parse(String),

    /// A duration string could not be parsed.
    #[error("invalid duration '{value}': {reason}")]
    Duration {
        /// The offending input.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A template entry is invalid.
    #[error("template {destination}: {message}")]
    Template {
        /// Destination of the offending template.
        destination: String,
        /// What is wrong with it.
        message: String,
    },

    /// Two templates write the same destination.
    #[error("duplicate destination: {0}")]
    DuplicateDestination(PathBuf),

    /// Any other invalid setting.
    #[error("configuration error: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Creates a [`ConfigError::Template`] for the given destination.
    pub fn template(destination: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Template {
            destination: destination.into().display().to_string(),
            message: message.into(),
        }
    }

    /// Creates a [`ConfigError::Duration`].
    pub fn duration(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Duration {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while committing a rendered file to disk.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The parent directory is missing and creation is disabled.
    #[error("destination directory '{0}' does not exist and create_dest_dirs is disabled")]
    MissingDirectory(PathBuf),

    /// The parent directory could not be created.
    #[error("failed to create directory '{path}': {source}")]
    CreateDirectory {
        /// Directory being created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The previous file could not be preserved.
    #[error("failed to back up '{path}': {source}")]
    Backup {
        /// File being backed up.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The temporary file could not be written.
    #[error("failed to write '{path}': {source}")]
    Write {
        /// Destination being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Permission bits could not be applied.
    #[error("failed to set mode {mode:04o} on '{path}': {source}")]
    Permissions {
        /// File whose mode was being set.
        path: PathBuf,
        /// Requested mode.
        mode: u32,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Ownership could not be applied.
    #[error("failed to change owner of '{path}': {source}")]
    Ownership {
        /// File whose owner was being set.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configured user does not exist.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// The configured group does not exist.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    /// The account database could not be queried.
    #[error("failed to look up account '{name}': {source}")]
    AccountLookup {
        /// User or group name being resolved.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The atomic rename onto the destination failed.
    #[error("failed to replace '{path}': {source}")]
    Rename {
        /// Destination being replaced.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a post-render command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command string could not be tokenized.
    #[error("invalid command: {0}")]
    Invalid(String),

    /// The process could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The process ran but did not succeed.
    #[error("command exited unsuccessfully ({})", describe_exit(.code, .signal))]
    NonZeroExit {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if the process was killed.
        signal: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The process outlived its timeout and was killed.
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout that elapsed.
        timeout: Duration,
        /// Output captured before the kill.
        stdout: String,
        /// Error output captured before the kill.
        stderr: String,
    },

    /// Waiting on the process failed.
    #[error("failed waiting for command: {0}")]
    Wait(#[source] std::io::Error),
}

impl CommandError {
    /// Exit code to record for this failure, if the process exited normally.
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }

    /// Captured standard error, when the process ran.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { stderr, .. } | Self::Timeout { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

#[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}
