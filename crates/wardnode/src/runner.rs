//! Per-template render loop.
//!
//! Each template is driven by one [`TemplateRunner`] task moving through an
//! explicit [`Phase`] machine:
//!
//! ```text
//! Idle -> Debouncing -> Rendering -> Committing -> Executing -> Idle
//!                            |            |
//!                            +------------+--> Idle (failure or unchanged)
//! ```
//!
//! Changes that arrive after a cycle has taken its snapshot set the pending
//! flag, so the runner goes straight back into a debounce window instead of
//! waiting for the next change.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use ward_kv::{ChangeEvent, KvBackend, KvCache};

use crate::commit::{CommitOutcome, FileCommitter, RenderedArtifact};
use crate::exec::CommandExecutor;
use crate::report::{CycleOutcome, CycleReport};
use crate::schedule::DebounceWindow;
use crate::spec::TemplateSpec;

/// Where a runner is in its cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a change.
    Idle,
    /// Collecting a burst of changes.
    Debouncing(DebounceWindow),
    /// Taking a snapshot and rendering.
    Rendering,
    /// Writing rendered bytes to the destination.
    Committing(Vec<u8>),
    /// Running the post-render command.
    Executing {
        /// Backup made by the commit.
        backup: Option<PathBuf>,
    },
}

impl Phase {
    /// The phase without its payload.
    pub const fn kind(&self) -> PhaseKind {
        match self {
            Self::Idle => PhaseKind::Idle,
            Self::Debouncing(_) => PhaseKind::Debouncing,
            Self::Rendering => PhaseKind::Rendering,
            Self::Committing(_) => PhaseKind::Committing,
            Self::Executing { .. } => PhaseKind::Executing,
        }
    }
}

/// Payload-free [`Phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Waiting for a change.
    Idle,
    /// Collecting a burst of changes.
    Debouncing,
    /// Taking a snapshot and rendering.
    Rendering,
    /// Writing the destination.
    Committing,
    /// Running the post-render command.
    Executing,
    /// The runner has exited.
    Stopped,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Debouncing => "debouncing",
            Self::Rendering => "rendering",
            Self::Committing => "committing",
            Self::Executing => "executing",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable state of one template's runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRunState {
    /// Current phase.
    pub phase: PhaseKind,
    /// Open debounce window, while debouncing.
    pub window: Option<DebounceWindow>,
    /// A change arrived after the current cycle's snapshot.
    pub pending_change: bool,
    /// Exit code of the last command, if it exited normally.
    pub last_exit: Option<i32>,
    /// Cycles completed.
    pub cycles: u64,
}

impl Default for TemplateRunState {
    fn default() -> Self {
        Self {
            phase: PhaseKind::Idle,
            window: None,
            pending_change: false,
            last_exit: None,
            cycles: 0,
        }
    }
}

/// Drives one template from change events to committed files.
pub struct TemplateRunner<B> {
    spec: Arc<TemplateSpec>,
    cache: Arc<KvCache<B>>,
    committer: FileCommitter,
    executor: CommandExecutor,
    events: mpsc::Receiver<ChangeEvent>,
    reports: mpsc::Sender<CycleReport>,
    shutdown: CancellationToken,
    artifact: Option<RenderedArtifact>,
    state: TemplateRunState,
    status: watch::Sender<TemplateRunState>,
}

impl<B: KvBackend> TemplateRunner<B> {
    /// Creates a runner.
    ///
    /// The current destination content, if any, is fingerprinted so an
    /// identical first render does not rewrite it. Templates without
    /// dependencies start with a pending change so they render once.
    pub fn new(
        spec: Arc<TemplateSpec>,
        cache: Arc<KvCache<B>>,
        events: mpsc::Receiver<ChangeEvent>,
        reports: mpsc::Sender<CycleReport>,
        shutdown: CancellationToken,
    ) -> Self {
        let artifact = RenderedArtifact::load(&spec.destination).unwrap_or_else(|e| {
            warn!(
                destination = %spec.destination.display(),
                error = %e,
                "could not read current destination, first render will rewrite it"
            );
            None
        });
        let state = TemplateRunState {
            pending_change: spec.dependencies.is_empty(),
            ..TemplateRunState::default()
        };
        let (status, _) = watch::channel(state.clone());

        Self {
            spec,
            cache,
            committer: FileCommitter::new(),
            executor: CommandExecutor::new(),
            events,
            reports,
            shutdown,
            artifact,
            state,
            status,
        }
    }

    /// Replaces the command executor.
    #[must_use]
    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Subscribes to state changes.
    pub fn status(&self) -> watch::Receiver<TemplateRunState> {
        self.status.subscribe()
    }

    /// Runs until shutdown is requested.
    ///
    /// Shutdown is honoured between phases. A command that is already
    /// running is allowed to finish.
    pub async fn run(mut self) {
        let destination = self.spec.destination.display().to_string();
        info!(destination = %destination, wait = %self.spec.wait, "template runner started");

        let mut phase = Phase::Idle;
        loop {
            self.publish(&phase);
            let next = match phase {
                Phase::Idle => self.idle().await,
                Phase::Debouncing(window) => self.debounce(window).await,
                Phase::Rendering => Some(self.render().await),
                Phase::Committing(contents) => Some(self.commit(&contents)),
                Phase::Executing { backup } => Some(self.execute(backup).await),
            };
            match next {
                Some(next) => {
                    trace!(destination = %destination, phase = %next.kind(), "transition");
                    phase = next;
                }
                None => break,
            }
        }

        self.state.phase = PhaseKind::Stopped;
        self.state.window = None;
        self.status.send_replace(self.state.clone());
        info!(destination = %destination, cycles = self.state.cycles, "template runner stopped");
    }

    fn publish(&mut self, phase: &Phase) {
        self.state.phase = phase.kind();
        self.state.window = match phase {
            Phase::Debouncing(window) => Some(*window),
            _ => None,
        };
        self.status.send_replace(self.state.clone());
    }

    async fn idle(&mut self) -> Option<Phase> {
        if std::mem::take(&mut self.state.pending_change) {
            debug!(
                destination = %self.spec.destination.display(),
                "changes arrived during the last cycle"
            );
            return Some(self.open_window());
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            event = self.events.recv() => match event {
                Some(event) => {
                    debug!(
                        destination = %self.spec.destination.display(),
                        query = %event.query,
                        index = event.index,
                        "change received"
                    );
                    Some(self.open_window())
                }
                None => {
                    // Nothing watches this template's keys any more.
                    self.shutdown.cancelled().await;
                    None
                }
            },
        }
    }

    fn open_window(&self) -> Phase {
        Phase::Debouncing(DebounceWindow::open(Instant::now(), &self.spec.wait))
    }

    async fn debounce(&mut self, mut window: DebounceWindow) -> Option<Phase> {
        let mut open = true;
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep_until(window.deadline()) => {
                    debug!(
                        destination = %self.spec.destination.display(),
                        changes = window.changes(),
                        waited_ms = window.started().elapsed().as_millis() as u64,
                        "debounce window elapsed"
                    );
                    return Some(Phase::Rendering);
                }
                event = self.events.recv(), if open => {
                    let Some(event) = event else {
                        open = false;
                        continue;
                    };
                    window.extend(Instant::now(), &self.spec.wait);
                    trace!(
                        destination = %self.spec.destination.display(),
                        index = event.index,
                        deadline_in_ms = window
                            .deadline()
                            .saturating_duration_since(Instant::now())
                            .as_millis() as u64,
                        "debounce window extended"
                    );
                    self.state.window = Some(window);
                    self.status.send_replace(self.state.clone());
                }
            }
        }
    }

    async fn render(&mut self) -> Phase {
        // Anything already queued is covered by the snapshot taken below.
        self.drain_events();

        let view = self.cache.view(&self.spec.dependencies).await;
        match self
            .spec
            .template
            .render(view.values(), self.spec.render_options())
        {
            Ok(rendered) => {
                if !rendered.missing.is_empty() {
                    warn!(
                        destination = %self.spec.destination.display(),
                        missing = ?rendered.missing,
                        "rendered with missing keys"
                    );
                }
                Phase::Committing(rendered.contents)
            }
            Err(e) => {
                error!(
                    destination = %self.spec.destination.display(),
                    error = %e,
                    "render failed, destination left untouched"
                );
                self.finish(CycleOutcome::RenderFailed(e));
                Phase::Idle
            }
        }
    }

    fn commit(&mut self, contents: &[u8]) -> Phase {
        match self.committer.commit(&self.spec, contents, &mut self.artifact) {
            Ok(CommitOutcome::Unchanged) => {
                debug!(
                    destination = %self.spec.destination.display(),
                    "rendered content unchanged"
                );
                self.finish(CycleOutcome::Unchanged);
                Phase::Idle
            }
            Ok(CommitOutcome::Written { backup }) => {
                info!(
                    destination = %self.spec.destination.display(),
                    bytes = contents.len(),
                    backup = ?backup,
                    "destination updated"
                );
                if self.spec.command.is_some() {
                    Phase::Executing { backup }
                } else {
                    self.finish(CycleOutcome::Committed {
                        backup,
                        command: None,
                    });
                    Phase::Idle
                }
            }
            Err(e) => {
                error!(
                    destination = %self.spec.destination.display(),
                    error = %e,
                    "commit failed, destination left untouched"
                );
                self.finish(CycleOutcome::CommitFailed(e));
                Phase::Idle
            }
        }
    }

    async fn execute(&mut self, backup: Option<PathBuf>) -> Phase {
        let spec = Arc::clone(&self.spec);
        let Some(command) = spec.command.as_ref() else {
            self.finish(CycleOutcome::Committed {
                backup,
                command: None,
            });
            return Phase::Idle;
        };

        info!(
            destination = %spec.destination.display(),
            command = %command,
            timeout_ms = spec.command_timeout.as_millis() as u64,
            "running command"
        );
        match self.executor.run(command, spec.command_timeout).await {
            Ok(outcome) => {
                info!(
                    destination = %spec.destination.display(),
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "command succeeded"
                );
                self.state.last_exit = Some(0);
                self.finish(CycleOutcome::Committed {
                    backup,
                    command: Some(outcome),
                });
            }
            Err(error) => {
                error!(
                    destination = %spec.destination.display(),
                    command = %command,
                    error = %error,
                    stderr = error.stderr().unwrap_or_default(),
                    "command failed"
                );
                self.state.last_exit = error.exit_code();
                self.finish(CycleOutcome::CommandFailed { backup, error });
            }
        }
        Phase::Idle
    }

    fn drain_events(&mut self) -> usize {
        let mut drained = 0;
        while self.events.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    fn finish(&mut self, outcome: CycleOutcome) {
        self.state.cycles += 1;
        if self.drain_events() > 0 {
            self.state.pending_change = true;
        }

        let report = CycleReport::new(self.spec.destination.clone(), outcome);
        match self.reports.try_send(report) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                debug!(
                    destination = %report.destination.display(),
                    outcome = report.outcome.label(),
                    "report channel full, dropping report"
                );
            }
        }
    }
}
