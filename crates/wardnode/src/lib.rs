//! # wardnode
//!
//! Node agent that keeps a secrets service's configuration files in sync
//! with cluster key-value data.
//!
//! For every configured template the agent:
//! - watches the keys the template reads
//! - waits for changes to settle (`wait.min`, capped at `wait.max`)
//! - renders from a consistent snapshot
//! - atomically replaces the destination when the content changed
//! - runs a reload command with a timeout
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wardnode::config::AgentConfig;
//! use wardnode::supervisor::{Supervisor, SupervisorConfig};
//! use ward_kv::KvCache;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig::from_file("/etc/ward/config.toml")?;
//! let registry = config.registry()?;
//! let cache = Arc::new(KvCache::new(
//!     Arc::new(config.consul.backend()?),
//!     config.cache.max_stale,
//! ));
//! let handle = Supervisor::new(
//!     registry,
//!     cache,
//!     config.watch.watch_config(),
//!     SupervisorConfig::default(),
//! )
//! .start();
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod commit;
pub mod config;
pub mod duration;
pub mod error;
pub mod exec;
pub mod owner;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod spec;
pub mod supervisor;
pub mod telemetry;

pub use commit::{CommitOutcome, FileCommitter, RenderedArtifact, StagedCommit};
pub use config::{AgentConfig, TemplateConfig};
pub use error::{CommandError, CommitError, ConfigError};
pub use exec::{CommandExecutor, CommandLine, CommandOutcome};
pub use report::{CycleOutcome, CycleReport};
pub use runner::{Phase, PhaseKind, TemplateRunState, TemplateRunner};
pub use schedule::DebounceWindow;
pub use spec::{FileMode, Ownership, TemplateRegistry, TemplateSpec, WaitConfig};
pub use supervisor::{
    OnceMode, ShutdownSummary, Supervisor, SupervisorConfig, SupervisorHandle, render_once,
};
