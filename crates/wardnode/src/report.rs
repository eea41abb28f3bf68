//! Per-cycle results published by template runners.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use ward_render::RenderError;

use crate::error::{CommandError, CommitError};
use crate::exec::CommandOutcome;

/// How a render cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Rendered content matched the destination; nothing was written or run.
    Unchanged,
    /// The destination was replaced and the command, if any, succeeded.
    Committed {
        /// Backup of the previous content.
        backup: Option<PathBuf>,
        /// Result of the post-render command.
        command: Option<CommandOutcome>,
    },
    /// Rendered without writing anything.
    DryRun {
        /// The rendered bytes.
        contents: Vec<u8>,
    },
    /// The template could not be rendered.
    RenderFailed(RenderError),
    /// The destination could not be written.
    CommitFailed(CommitError),
    /// The destination was replaced but the command failed.
    CommandFailed {
        /// Backup of the previous content.
        backup: Option<PathBuf>,
        /// The failure.
        error: CommandError,
    },
}

impl CycleOutcome {
    /// Whether this outcome should be treated as a failure.
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RenderFailed(_) | Self::CommitFailed(_) | Self::CommandFailed { .. }
        )
    }

    /// Short label for logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Committed { .. } => "committed",
            Self::DryRun { .. } => "dry-run",
            Self::RenderFailed(_) => "render-failed",
            Self::CommitFailed(_) => "commit-failed",
            Self::CommandFailed { .. } => "command-failed",
        }
    }
}

/// Result of one cycle for one template.
#[derive(Debug)]
pub struct CycleReport {
    /// Template destination.
    pub destination: PathBuf,
    /// What happened.
    pub outcome: CycleOutcome,
    /// When the cycle ended.
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    /// Creates a report stamped with the current time.
    pub fn new(destination: PathBuf, outcome: CycleOutcome) -> Self {
        Self {
            destination,
            outcome,
            finished_at: Utc::now(),
        }
    }

    /// Whether the cycle failed.
    pub const fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }

    /// Emits a summary log line.
    pub fn log(&self) {
        let destination = self.destination.display();
        match &self.outcome {
            CycleOutcome::Unchanged | CycleOutcome::DryRun { .. } => {
                info!(destination = %destination, outcome = self.outcome.label(), "cycle finished");
            }
            CycleOutcome::Committed { backup, command } => info!(
                destination = %destination,
                backup = ?backup,
                command_ms = command.as_ref().map(|c| c.elapsed.as_millis() as u64),
                "cycle finished, destination updated"
            ),
            CycleOutcome::RenderFailed(e) => {
                error!(destination = %destination, error = %e, "cycle failed: render");
            }
            CycleOutcome::CommitFailed(e) => {
                error!(destination = %destination, error = %e, "cycle failed: commit");
            }
            CycleOutcome::CommandFailed { error, .. } => warn!(
                destination = %destination,
                error = %error,
                stderr = error.stderr().unwrap_or_default(),
                "cycle failed: command"
            ),
        }
    }
}
