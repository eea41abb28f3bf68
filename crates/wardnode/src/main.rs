//! wardnode - Ward Node Agent
//!
//! Runs next to a secrets service and keeps its configuration files rendered
//! from cluster key-value data, reloading the service when they change.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use ward_kv::KvCache;
use wardnode::config::AgentConfig;
use wardnode::report::CycleOutcome;
use wardnode::supervisor::{OnceMode, Supervisor, SupervisorConfig, render_once};
use wardnode::telemetry::{self, LogFormat};
use wardnode::CommandExecutor;

const DEFAULT_CONFIG: &str = "/etc/ward/config.toml";

#[derive(Parser)]
#[command(name = "wardnode")]
#[command(about = "Ward Node Agent - renders secrets-service configuration from cluster data")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG, env = "WARD_CONFIG")]
        config: PathBuf,
    },

    /// Render every template once and exit
    Once {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG, env = "WARD_CONFIG")]
        config: PathBuf,

        /// Print rendered output instead of writing files or running commands
        #[arg(long)]
        dry: bool,
    },

    /// Validate the config file and every template
    Check {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG, env = "WARD_CONFIG")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    match cli.command {
        Commands::Run { config } => run_agent(config).await,
        Commands::Once { config, dry } => run_once(config, dry).await,
        Commands::Check { config } => check(&config),
        Commands::InitConfig { output, force } => init_config(&output, force),
    }
}

async fn run_agent(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting wardnode");

    let config = AgentConfig::from_file(&config_path)?;
    let registry = config.registry()?;
    info!(
        consul = %config.consul.address,
        templates = registry.len(),
        queries = registry.queries().len(),
        "loaded config"
    );

    let backend = Arc::new(config.consul.backend()?);
    let cache = Arc::new(KvCache::new(backend, config.cache.max_stale));
    let supervisor = Supervisor::new(
        registry,
        cache,
        config.watch.watch_config(),
        SupervisorConfig {
            shutdown_grace: config.shutdown_grace,
            ..SupervisorConfig::default()
        },
    );

    let mut handle = supervisor.start();
    let mut reports = handle
        .take_reports()
        .context("report stream already taken")?;

    let mut failures = 0u64;
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            () = &mut signal => break,
            report = reports.recv() => match report {
                Some(report) => {
                    report.log();
                    if report.is_failure() {
                        failures += 1;
                    }
                }
                None => break,
            },
        }
    }

    let summary = handle.shutdown().await;
    info!(
        failures,
        finished = summary.finished,
        aborted = summary.aborted,
        "wardnode stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received interrupt"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn run_once(config_path: PathBuf, dry: bool) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(&config_path)?;
    let registry = config.registry()?;
    let cache = KvCache::new(Arc::new(config.consul.backend()?), config.cache.max_stale);
    let mode = if dry { OnceMode::DryRun } else { OnceMode::Commit };

    let reports = render_once(&registry, &cache, CommandExecutor::new(), mode).await;

    let mut failed = 0usize;
    let mut stdout = std::io::stdout().lock();
    for report in &reports {
        if let CycleOutcome::DryRun { contents } = &report.outcome {
            writeln!(stdout, "> {}", report.destination.display())?;
            stdout.write_all(contents)?;
            if !contents.ends_with(b"\n") {
                writeln!(stdout)?;
            }
        } else {
            report.log();
        }
        if report.is_failure() {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} templates failed", reports.len());
    }
    Ok(())
}

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let registry = config
        .registry()
        .with_context(|| format!("invalid templates in {}", config_path.display()))?;

    println!("Config OK: {}", config_path.display());
    for spec in registry.iter() {
        println!("  {} <- {}", spec.destination.display(), spec.source);
        println!("    wait: {}", spec.wait);
        for query in &spec.dependencies {
            println!("    watches: {query}");
        }
        if let Some(command) = &spec.command {
            println!("    command: {command} (timeout {:?})", spec.command_timeout);
        }
    }
    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", output.display());
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = AgentConfig::sample().to_toml()?;
    std::fs::write(output, content)?;

    println!("Config written to: {}", output.display());
    println!();
    println!("Edit the [consul] address and [[template]] entries, then run:");
    println!("  wardnode run --config {}", output.display());

    Ok(())
}
