use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use labqueue::config::{
    ContainerConfig, LogStoreConfig, LogWriterConfig, ServerConfig, SlotConfig, WorkerConfig,
};
use labqueue::server::Server;
use labqueue::shutdown::install_shutdown_handler;
use labqueue::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "labqueue")]
#[command(version)]
#[command(about = "A job scheduler for containerised GPU experiments")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the central server (HTTP API, worker RPC, job store)
    Server(ServerArgs),

    /// Start a worker that polls a server and runs jobs in containers
    Worker(WorkerArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct ContainerArgs {
    /// Docker CLI binary
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Run containers without network access
    #[arg(long)]
    no_network: bool,

    /// Memory limit per container (e.g., "16g")
    #[arg(long)]
    memory_limit: Option<String>,

    /// CPU limit per container (e.g., "4")
    #[arg(long)]
    cpu_limit: Option<String>,

    /// Keep containers after their logs are drained
    #[arg(long)]
    keep_containers: bool,

    /// Interval between log flushes to the server
    #[arg(long, default_value = "500")]
    flush_interval_ms: u64,
}

impl ContainerArgs {
    fn container(&self) -> ContainerConfig {
        ContainerConfig {
            docker_bin: self.docker_bin.clone(),
            network_disabled: self.no_network,
            memory_limit: self.memory_limit.clone(),
            cpu_limit: self.cpu_limit.clone(),
            remove_after_exit: !self.keep_containers,
        }
    }

    fn log_writer(&self) -> LogWriterConfig {
        LogWriterConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            ..LogWriterConfig::default()
        }
    }
}

/// Turn repeated `--slot` values into slot configs. Each value is a
/// comma-separated GPU list; an empty value is a slot without GPUs.
fn parse_slots(values: &[String]) -> Vec<SlotConfig> {
    values
        .iter()
        .enumerate()
        .map(|(id, devices)| SlotConfig::parse(id, devices))
        .collect()
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Address for the worker gRPC service
    #[arg(long, default_value = "0.0.0.0:50051")]
    grpc_addr: SocketAddr,

    /// PostgreSQL URL. Without it jobs are kept in memory.
    #[arg(long, env = "LABQUEUE_DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum pooled database connections
    #[arg(long, default_value = "10")]
    max_db_connections: u32,

    /// Accepted access tokens (repeat, or comma-separate in the env var)
    #[arg(long = "token", env = "LABQUEUE_TOKENS", value_delimiter = ',', required = true)]
    tokens: Vec<String>,

    /// Directory holding job logs
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Timeout for non-streaming HTTP requests
    #[arg(long, default_value = "15")]
    request_timeout_secs: u64,

    /// Run a worker slot inside the server (repeat per slot, value is a GPU list)
    #[arg(long = "slot")]
    slots: Vec<String>,

    /// Poll interval for embedded slots
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    #[command(flatten)]
    container: ContainerArgs,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Server gRPC endpoint
    #[arg(long, short = 's', default_value = "http://127.0.0.1:50051")]
    server: String,

    /// Access token presented to the server
    #[arg(long, env = "LABQUEUE_TOKEN")]
    token: String,

    /// Worker name reported with each claim
    #[arg(long, default_value = "worker")]
    name: String,

    /// Slot GPU list (repeat per slot). Defaults to one slot without GPUs.
    #[arg(long = "slot")]
    slots: Vec<String>,

    /// Interval between polls when a slot is idle
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    #[command(flatten)]
    container: ContainerArgs,
}

// =============================================================================
// Entry Points
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        http_addr: args.http_addr,
        grpc_addr: args.grpc_addr,
        database_url: args.database_url,
        max_db_connections: args.max_db_connections,
        tokens: args.tokens,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
        logs: LogStoreConfig::new(args.log_dir),
        embedded_slots: parse_slots(&args.slots),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        container: args.container.container(),
        log_writer: args.container.log_writer(),
    };

    tracing::info!(
        log_dir = %config.logs.dir.display(),
        request_timeout = ?config.request_timeout,
        tokens = config.tokens.len(),
        "Server configuration loaded"
    );

    let shutdown = install_shutdown_handler();
    Server::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_worker_cmd(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let slots = if args.slots.is_empty() {
        vec![SlotConfig::default()]
    } else {
        parse_slots(&args.slots)
    };

    let config = WorkerConfig {
        server_url: args.server,
        token: args.token,
        name: args.name,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        slots,
        container: args.container.container(),
        log_writer: args.container.log_writer(),
    };

    let shutdown = install_shutdown_handler();
    let report = run_worker(config, shutdown).await?;

    tracing::info!(
        finished = report.jobs.finished,
        cancelled = report.jobs.cancelled,
        unreported = report.jobs.unreported,
        ticks = report.poller.ticks,
        poll_errors = report.poller.errors,
        "Worker stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Worker(worker_args) => run_worker_cmd(worker_args).await,
    }
}
