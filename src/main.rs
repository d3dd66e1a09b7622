use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use dispatch_lite::agent::Agent;
use dispatch_lite::api::{ErrorResponse, RunRequest, RunResponse};
use dispatch_lite::config::{AgentConfig, CoordinatorConfig, MasterConfig, TransportConfig};
use dispatch_lite::jobs::AgentResult;
use dispatch_lite::node::Master;
use dispatch_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "Run commands across remote agents and collect the results")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a master that agents connect to
    Master(MasterArgs),

    /// Start an agent that executes commands sent by the master
    Agent(AgentArgs),

    /// Run a command on agents through a master's API
    Run(RunArgs),
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Port agents connect to
    #[arg(long, default_value = "4506")]
    port: u16,

    /// Port for the HTTP API (optional)
    #[arg(long)]
    api_port: Option<u16>,

    /// Default per-run timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Agents silent for this long are treated as dead
    #[arg(long, default_value = "5000")]
    agent_timeout_ms: u64,

    /// Maximum number of jobs in flight
    #[arg(long, default_value = "10000")]
    max_jobs: usize,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Agent ID (unique identifier the master targets)
    #[arg(long)]
    id: String,

    /// Master address (host:port)
    #[arg(long, default_value = "127.0.0.1:4506")]
    master: String,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "500")]
    heartbeat_ms: u64,

    /// Maximum jobs executing at once
    #[arg(long, default_value = "16")]
    max_concurrent_jobs: usize,

    /// Enable the cmd.run built-in (executes via sh -c).
    /// NOT recommended on shared hosts.
    #[arg(long)]
    allow_shell: bool,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Master API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Target agents, comma-separated; glob patterns allowed (e.g. "web-*")
    #[arg(long, short = 't', value_delimiter = ',', required = true)]
    targets: Vec<String>,

    /// Timeout in milliseconds (master default if omitted)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// The command to run (e.g. "test.ping", "cmd.run")
    command: String,

    /// Arguments passed to the command
    arguments: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let api_addr: Option<SocketAddr> = match args.api_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = MasterConfig {
        transport: TransportConfig::new(listen_addr).with_agent_timeout_ms(args.agent_timeout_ms),
        coordinator: CoordinatorConfig {
            default_timeout_ms: args.timeout_ms,
            ..CoordinatorConfig::default()
        }
        .with_max_jobs(args.max_jobs),
        api_addr,
    };

    tracing::info!(
        listen_addr = %config.transport.listen_addr,
        api_addr = ?config.api_addr,
        default_timeout_ms = config.coordinator.default_timeout_ms,
        "Starting dispatch-lite master"
    );

    let shutdown = install_shutdown_handler()?;
    Master::new(config).run(shutdown).await
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    if args.allow_shell {
        tracing::warn!("cmd.run is enabled, the master can execute arbitrary shell commands");
    }

    let config = AgentConfig {
        max_concurrent_jobs: args.max_concurrent_jobs,
        ..AgentConfig::new(args.id, args.master)
            .with_shell(args.allow_shell)
            .with_heartbeat_interval_ms(args.heartbeat_ms)
    };

    tracing::info!(
        agent_id = %config.agent_id,
        master = %config.master_addr,
        "Starting dispatch-lite agent"
    );

    let shutdown = install_shutdown_handler()?;
    Agent::new(config).run(shutdown).await;
    Ok(())
}

async fn run_client(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/run", args.addr.trim_end_matches('/'));
    let request = RunRequest {
        command: args.command,
        arguments: args.arguments,
        targets: args.targets,
        timeout_ms: args.timeout_ms,
    };

    let response = reqwest::Client::new().post(&url).json(&request).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        eprintln!("Error: {}", message);
        std::process::exit(1);
    }

    let body: RunResponse = response.json().await?;
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&body.results)?);
        }
        OutputFormat::Table => print_results(&body),
    }

    if body.results.values().any(|r| !r.is_success()) {
        std::process::exit(2);
    }
    Ok(())
}

fn print_results(body: &RunResponse) {
    if body.results.is_empty() {
        println!("No agents matched.");
        return;
    }

    println!("{:<24} {:<10} OUTPUT", "AGENT", "STATUS");
    println!("{}", "-".repeat(60));
    for (agent, result) in &body.results {
        let mut lines = result.output().unwrap_or("").lines();
        println!(
            "{:<24} {:<10} {}",
            agent,
            result.to_string().to_uppercase(),
            lines.next().unwrap_or("")
        );
        for line in lines {
            println!("{:<24} {:<10} {}", "", "", line);
        }
    }

    let timed_out = body
        .results
        .values()
        .filter(|r| matches!(r, AgentResult::Timeout))
        .count();
    println!();
    println!("{} agents, {} timed out", body.results.len(), timed_out);
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Master(master_args) => run_master(master_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Run(run_args) => run_client(run_args).await?,
    }

    Ok(())
}
