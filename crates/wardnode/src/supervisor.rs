//! Task supervision.
//!
//! The supervisor owns every task the agent runs: one watch per distinct
//! query, fanning change events out to the runners of the templates that
//! depend on it, and one [`TemplateRunner`] per template. Shutdown cancels
//! watches and debounce windows immediately and gives in-flight commands a
//! grace period before aborting them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ward_kv::{ChangeEvent, KvBackend, KvCache, KvQuery, WatchConfig, Watcher};

use crate::commit::{CommitOutcome, FileCommitter, RenderedArtifact};
use crate::config::DEFAULT_SHUTDOWN_GRACE;
use crate::exec::CommandExecutor;
use crate::report::{CycleOutcome, CycleReport};
use crate::runner::{TemplateRunState, TemplateRunner};
use crate::spec::{TemplateRegistry, TemplateSpec};

/// Change events buffered per runner.
pub const DEFAULT_EVENT_BUFFER: usize = 16;

/// Reports buffered before new ones are dropped.
pub const REPORT_BUFFER: usize = 256;

/// Supervisor tuning.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// How long in-flight cycles may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Capacity of each runner's event channel.
    pub event_buffer: usize,
    /// Executor used by every runner.
    pub executor: CommandExecutor,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            event_buffer: DEFAULT_EVENT_BUFFER,
            executor: CommandExecutor::new(),
        }
    }
}

/// Starts and stops the agent's tasks.
pub struct Supervisor<B> {
    registry: TemplateRegistry,
    cache: Arc<KvCache<B>>,
    watch_config: WatchConfig,
    config: SupervisorConfig,
}

impl<B: KvBackend> Supervisor<B> {
    /// Creates a supervisor for `registry`.
    pub fn new(
        registry: TemplateRegistry,
        cache: Arc<KvCache<B>>,
        watch_config: WatchConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            watch_config,
            config,
        }
    }

    /// Spawns every runner and watch task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> SupervisorHandle {
        let shutdown = CancellationToken::new();
        let (report_tx, report_rx) = mpsc::channel(REPORT_BUFFER);
        let mut runners = JoinSet::new();
        let mut watches = JoinSet::new();
        let mut statuses = BTreeMap::new();
        let mut fanout: BTreeMap<KvQuery, Vec<mpsc::Sender<ChangeEvent>>> = BTreeMap::new();

        for spec in self.registry.iter() {
            let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
            for query in &spec.dependencies {
                fanout.entry(query.clone()).or_default().push(event_tx.clone());
            }
            let runner = TemplateRunner::new(
                Arc::clone(spec),
                Arc::clone(&self.cache),
                event_rx,
                report_tx.clone(),
                shutdown.child_token(),
            )
            .with_executor(self.config.executor);
            statuses.insert(spec.destination.clone(), runner.status());
            runners.spawn(runner.run());
        }

        let watcher = Watcher::new(Arc::clone(&self.cache), self.watch_config.clone());
        for (query, subscribers) in fanout {
            debug!(query = %query, subscribers = subscribers.len(), "starting watch");
            let stream = watcher.watch(query.clone());
            watches.spawn(forward(query, stream, subscribers, shutdown.clone()));
        }

        info!(
            templates = runners.len(),
            watches = watches.len(),
            "supervisor started"
        );

        SupervisorHandle {
            shutdown,
            runners,
            watches,
            reports: Some(report_rx),
            statuses,
            grace: self.config.shutdown_grace,
        }
    }
}

/// Delivers one watch's events to every subscribed runner.
///
/// A full runner channel already holds an event that will trigger a render
/// covering this change, so the event is dropped rather than awaited.
async fn forward(
    query: KvQuery,
    mut stream: BoxStream<'static, ChangeEvent>,
    subscribers: Vec<mpsc::Sender<ChangeEvent>>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        for subscriber in &subscribers {
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.try_send(event.clone()) {
                debug!(query = %query, "runner busy, change coalesced");
            }
        }
    }
    debug!(query = %query, "watch stopped");
}

/// Result of a supervised shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Runners that stopped on their own within the grace period.
    pub finished: usize,
    /// Runners aborted when the grace period ran out.
    pub aborted: usize,
}

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    shutdown: CancellationToken,
    runners: JoinSet<()>,
    watches: JoinSet<()>,
    reports: Option<mpsc::Receiver<CycleReport>>,
    statuses: BTreeMap<PathBuf, watch::Receiver<TemplateRunState>>,
    grace: Duration,
}

impl SupervisorHandle {
    /// Takes the stream of cycle reports. Returns `None` after the first call.
    pub fn take_reports(&mut self) -> Option<mpsc::Receiver<CycleReport>> {
        self.reports.take()
    }

    /// Current state of every runner, by destination.
    pub fn states(&self) -> BTreeMap<PathBuf, TemplateRunState> {
        self.statuses
            .iter()
            .map(|(destination, status)| (destination.clone(), status.borrow().clone()))
            .collect()
    }

    /// Subscribes to one runner's state.
    pub fn subscribe(&self, destination: &Path) -> Option<watch::Receiver<TemplateRunState>> {
        self.statuses.get(destination).cloned()
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops every task.
    ///
    /// Watches and open debounce windows are cancelled at once. Runners in
    /// the middle of a cycle get the grace period to finish; whatever is
    /// still running afterwards is aborted, which kills its command.
    pub async fn shutdown(mut self) -> ShutdownSummary {
        info!(grace_ms = self.grace.as_millis() as u64, "shutting down");
        self.shutdown.cancel();

        let deadline = Instant::now() + self.grace;
        let mut finished = 0;
        let mut aborted = 0;
        loop {
            match tokio::time::timeout_at(deadline, self.runners.join_next()).await {
                Ok(Some(Ok(()))) => finished += 1,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "runner task failed");
                    finished += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    aborted = self.runners.len();
                    for (destination, state) in self.states() {
                        if state.phase != crate::runner::PhaseKind::Stopped {
                            warn!(
                                destination = %destination.display(),
                                phase = %state.phase,
                                "grace period elapsed, aborting"
                            );
                        }
                    }
                    self.runners.shutdown().await;
                    break;
                }
            }
        }

        self.watches.shutdown().await;
        info!(finished, aborted, "shutdown complete");
        ShutdownSummary { finished, aborted }
    }
}

/// Whether [`render_once`] writes destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceMode {
    /// Commit and run commands as usual.
    Commit,
    /// Render only; rendered bytes are returned in the reports.
    DryRun,
}

/// Renders every template once from a single snapshot and exits.
///
/// Debounce windows do not apply. Each template reads the current values of
/// its dependencies, and commits and runs its command unless `mode` is
/// [`OnceMode::DryRun`].
pub async fn render_once<B: KvBackend>(
    registry: &TemplateRegistry,
    cache: &KvCache<B>,
    executor: CommandExecutor,
    mode: OnceMode,
) -> Vec<CycleReport> {
    let mut reports = Vec::with_capacity(registry.len());
    for spec in registry.iter() {
        let outcome = once(spec, cache, executor, mode).await;
        reports.push(CycleReport::new(spec.destination.clone(), outcome));
    }
    reports
}

async fn once<B: KvBackend>(
    spec: &TemplateSpec,
    cache: &KvCache<B>,
    executor: CommandExecutor,
    mode: OnceMode,
) -> CycleOutcome {
    let view = cache.view(&spec.dependencies).await;
    let rendered = match spec.template.render(view.values(), spec.render_options()) {
        Ok(rendered) => rendered,
        Err(e) => return CycleOutcome::RenderFailed(e),
    };
    if !rendered.missing.is_empty() {
        warn!(
            destination = %spec.destination.display(),
            missing = ?rendered.missing,
            "rendered with missing keys"
        );
    }
    if mode == OnceMode::DryRun {
        return CycleOutcome::DryRun {
            contents: rendered.contents,
        };
    }

    let mut artifact = RenderedArtifact::load(&spec.destination).ok().flatten();
    let backup = match FileCommitter::new().commit(spec, &rendered.contents, &mut artifact) {
        Ok(CommitOutcome::Unchanged) => return CycleOutcome::Unchanged,
        Ok(CommitOutcome::Written { backup }) => backup,
        Err(e) => return CycleOutcome::CommitFailed(e),
    };

    match &spec.command {
        None => CycleOutcome::Committed {
            backup,
            command: None,
        },
        Some(command) => match executor.run(command, spec.command_timeout).await {
            Ok(outcome) => CycleOutcome::Committed {
                backup,
                command: Some(outcome),
            },
            Err(error) => CycleOutcome::CommandFailed { backup, error },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateConfig;
    use crate::runner::PhaseKind;
    use ward_kv::{BackoffConfig, MemoryKv};

    fn registry(templates: &[TemplateConfig]) -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        for template in templates {
            registry
                .register(template.build(None).expect("spec"))
                .expect("register");
        }
        registry
    }

    fn watch_config() -> WatchConfig {
        WatchConfig {
            blocking_wait: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_template_renders_without_watches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let destination = dir.path().join("static.hcl");
        let templates = [TemplateConfig::inline(&destination, "ui = true\n").with_wait("1s")];

        let backend = Arc::new(MemoryKv::new());
        let cache = Arc::new(KvCache::new(backend, Duration::from_secs(3600)));
        let mut handle = Supervisor::new(
            registry(&templates),
            cache,
            watch_config(),
            SupervisorConfig::default(),
        )
        .start();
        let mut reports = handle.take_reports().expect("reports");
        assert!(handle.take_reports().is_none());

        let report = reports.recv().await.expect("report");
        assert!(matches!(report.outcome, CycleOutcome::Committed { .. }));
        assert_eq!(std::fs::read_to_string(&destination).expect("read"), "ui = true\n");

        let mut status = handle.subscribe(&destination).expect("status");
        status
            .wait_for(|state| state.phase == PhaseKind::Idle && state.cycles == 1)
            .await
            .expect("idle");

        let summary = handle.shutdown().await;
        assert_eq!(summary, ShutdownSummary { finished: 1, aborted: 0 });
        assert_eq!(status.borrow().phase, PhaseKind::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_key_fans_out_to_every_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let templates = [
            TemplateConfig::inline(dir.path().join("a"), "{{ key \"shared\" }}").with_wait("1s"),
            TemplateConfig::inline(dir.path().join("b"), "b={{ key \"shared\" }}").with_wait("3s"),
        ];

        let backend = Arc::new(MemoryKv::new());
        backend.put("shared", "1");
        let cache = Arc::new(KvCache::new(Arc::clone(&backend), Duration::from_secs(3600)));
        let mut handle = Supervisor::new(
            registry(&templates),
            cache,
            watch_config(),
            SupervisorConfig::default(),
        )
        .start();
        let mut reports = handle.take_reports().expect("reports");
        assert_eq!(handle.states().len(), 2);

        let first = reports.recv().await.expect("report");
        let second = reports.recv().await.expect("report");
        assert_eq!(first.destination, dir.path().join("a"));
        assert_eq!(second.destination, dir.path().join("b"));

        backend.put("shared", "2");
        reports.recv().await.expect("report");
        reports.recv().await.expect("report");
        assert_eq!(std::fs::read_to_string(dir.path().join("a")).expect("read"), "2");
        assert_eq!(std::fs::read_to_string(dir.path().join("b")).expect("read"), "b=2");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_render_once_reports_unchanged_second_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let templates = [TemplateConfig::inline(dir.path().join("out"), "{{ key \"k\" }}")];
        let registry = registry(&templates);

        let backend = Arc::new(MemoryKv::new());
        backend.put("k", "v");
        let cache = KvCache::new(backend, Duration::from_secs(3600));

        let first = render_once(&registry, &cache, CommandExecutor::new(), OnceMode::Commit).await;
        assert!(matches!(first[0].outcome, CycleOutcome::Committed { .. }));
        let second = render_once(&registry, &cache, CommandExecutor::new(), OnceMode::Commit).await;
        assert!(matches!(second[0].outcome, CycleOutcome::Unchanged));
    }
}
