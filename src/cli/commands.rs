//! CLI command definitions for mrva-commander.
//!
//! Three process shapes share one binary: a standalone process running the
//! commander and its workers over the in-process queue, a server running the
//! commander alone, and an agent running workers alone.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commander::Commander;
use crate::config::{Config, QueueBackend};
use crate::deploy;
use crate::locator::DatabaseLocator;
use crate::metrics;
use crate::scheduler::queue::{JobQueue, QueueRole};
use crate::scheduler::{PoolStats, SystemProbe, WorkerContext, WorkerPool, WorkerPoolConfig};
use crate::server;
use crate::storage::ArtifactStore;

/// Distributed multi-repository variant analysis.
#[derive(Parser)]
#[command(name = "mrva-commander")]
#[command(about = "Fan CodeQL query packs out over many repositories and collect the results")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run commander, HTTP server and workers in one process.
    Standalone(StandaloneArgs),

    /// Run the commander and its HTTP server.
    Server(ServerArgs),

    /// Run a pool of analysis workers.
    Agent(AgentArgs),
}

/// Arguments for `mrva-commander standalone`.
#[derive(Parser, Debug)]
pub struct StandaloneArgs {
    /// Address to serve HTTP on (overrides MRVA_LISTEN_ADDR).
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Number of workers; 0 sizes the pool from host resources.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

/// Arguments for `mrva-commander server`.
#[derive(Parser, Debug)]
pub struct ServerArgs {
    /// Address to serve HTTP on (overrides MRVA_LISTEN_ADDR).
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

/// Arguments for `mrva-commander agent`.
#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Number of workers; 0 sizes the pool from host resources.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    metrics::init_metrics().context("failed to register metrics")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match cli.command {
        Commands::Standalone(args) => run_standalone(config, args, shutdown).await,
        Commands::Server(args) => run_server(config, args, shutdown).await,
        Commands::Agent(args) => run_agent(config, args, shutdown).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_standalone(
    mut config: Config,
    args: StandaloneArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if config.queue_backend != QueueBackend::Memory {
        warn!(
            configured = %config.queue_backend,
            "Standalone mode always uses the in-process queue"
        );
        config.queue_backend = QueueBackend::Memory;
    }

    let queue = deploy::queue(&config, QueueRole::Server).await?;
    let artifacts = deploy::artifacts(&config).await?;
    let databases = deploy::databases(&config)?;

    let pool = build_pool(&config, queue.clone(), artifacts.clone(), databases.clone(), &shutdown);
    let pool_task = tokio::spawn(pool.run_until_shutdown());

    serve_commander(&config, queue.clone(), artifacts, databases, &shutdown).await?;

    let stats = pool_task.await.context("worker pool task panicked")??;
    queue.close().await;
    print_summary(&stats);
    Ok(())
}

async fn run_server(
    mut config: Config,
    args: ServerArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if config.queue_backend == QueueBackend::Memory {
        warn!("Server mode with the in-process queue has no workers; jobs will stay queued");
    }

    let queue = deploy::queue(&config, QueueRole::Server).await?;
    let artifacts = deploy::artifacts(&config).await?;
    let databases = deploy::databases(&config)?;

    serve_commander(&config, queue.clone(), artifacts, databases, &shutdown).await?;
    queue.close().await;
    Ok(())
}

async fn run_agent(
    mut config: Config,
    args: AgentArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }

    let queue = deploy::queue(&config, QueueRole::Agent).await?;
    let artifacts = deploy::artifacts(&config).await?;
    let databases = deploy::databases(&config)?;

    let pool = build_pool(&config, queue.clone(), artifacts, databases, &shutdown);
    let stats = pool.run_until_shutdown().await?;
    queue.close().await;
    print_summary(&stats);
    Ok(())
}

/// Runs the commander, its result consumer and the HTTP server until
/// shutdown.
async fn serve_commander(
    config: &Config,
    queue: Arc<dyn JobQueue>,
    artifacts: Arc<dyn ArtifactStore>,
    databases: Arc<dyn DatabaseLocator>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let state = deploy::state(config).await?;
    let commander = Arc::new(
        Commander::new(queue, state, artifacts, databases).with_public_url(&config.public_url),
    );

    let consumer = commander.clone().spawn_result_consumer(shutdown.clone());
    let served = server::serve(config.listen_addr, server::router(commander), shutdown.clone()).await;

    // A failed listener also takes the rest of the process down.
    shutdown.cancel();
    consumer.await.context("result consumer panicked")?;
    served.with_context(|| format!("HTTP server on {} failed", config.listen_addr))
}

fn build_pool(
    config: &Config,
    queue: Arc<dyn JobQueue>,
    artifacts: Arc<dyn ArtifactStore>,
    databases: Arc<dyn DatabaseLocator>,
    shutdown: &CancellationToken,
) -> WorkerPool {
    let pool_config =
        WorkerPoolConfig::new(config.num_workers).with_worker_memory_mb(config.worker_memory_mb);
    let context = WorkerContext {
        queue,
        artifacts,
        databases,
        runner: deploy::runner(config),
    };
    WorkerPool::new(pool_config, context, Arc::new(SystemProbe), shutdown.clone())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

fn print_summary(stats: &PoolStats) {
    println!();
    println!("Jobs processed: {}", stats.total_processed());
    println!("  succeeded:    {}", stats.jobs_completed);
    println!("  failed:       {}", stats.jobs_failed);
    println!("  success rate: {:.1}%", stats.success_rate());
    println!("  average time: {:.1}s", stats.average_job_duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_standalone_command_options() {
        let cli = Cli::try_parse_from([
            "mrva-commander",
            "standalone",
            "--listen",
            "127.0.0.1:9000",
            "-w",
            "3",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Standalone(args) => {
                assert_eq!(args.listen.unwrap().port(), 9000);
                assert_eq!(args.workers, Some(3));
            }
            _ => panic!("Expected Standalone command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_agent_command_defaults_to_config() {
        let cli = Cli::try_parse_from(["mrva-commander", "agent", "--log-level", "debug"])
            .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Agent(args) => assert!(args.workers.is_none()),
            _ => panic!("Expected Agent command"),
        }
    }

    #[test]
    fn test_server_rejects_bad_listen_address() {
        assert!(Cli::try_parse_from(["mrva-commander", "server", "--listen", "nowhere"]).is_err());
    }
}
