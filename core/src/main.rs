//! AgentMesh core binary: runs the runtime (`serve`) or talks to an
//! already-running one over the administrative control channel
//! (`agents list`, `plan status`, `shutdown`).

use agentmesh_core::{config::CoreConfig, ipc, init_logging, Runtime};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "agentmesh", version, about = "Multi-agent message fabric and planner")]
struct Cli {
    /// Optional TOML configuration file (layered under CORE_* env vars).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the core runtime.
    Serve,
    #[command(subcommand)]
    Agents(AgentsCommand),
    #[command(subcommand)]
    Plan(PlanCommand),
    /// Broadcast shutdown to a running `serve` process.
    Shutdown {
        /// Wait for current plans to finish before exiting.
        #[arg(long)]
        drain: bool,
    },
}

#[derive(Subcommand)]
enum AgentsCommand {
    /// Show the registry snapshot.
    List,
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Print a plan's current status.
    Status { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match CoreConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:?}");
            return ExitCode::from(2);
        }
    };

    init_logging(&config.log_level);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: CliCommand, config: CoreConfig) -> anyhow::Result<()> {
    match command {
        CliCommand::Serve => serve(config).await,
        CliCommand::Agents(AgentsCommand::List) => {
            let response = ipc::request(&config.listen_path, ipc::Request::AgentsList).await?;
            print_response(response);
            Ok(())
        }
        CliCommand::Plan(PlanCommand::Status { id }) => {
            let plan_id: agentmesh_shared::ids::PlanId = id
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid plan id: {id}"))?;
            let response = ipc::request(&config.listen_path, ipc::Request::PlanStatus { plan_id }).await?;
            print_response(response);
            Ok(())
        }
        CliCommand::Shutdown { drain } => {
            let response = ipc::request(&config.listen_path, ipc::Request::Shutdown { drain }).await?;
            print_response(response);
            Ok(())
        }
    }
}

async fn serve(config: CoreConfig) -> anyhow::Result<()> {
    info!("starting agentmesh core on {}", config.listen_path);
    let listen_path = config.listen_path.clone();
    let runtime = std::sync::Arc::new(Runtime::bootstrap(config).await?);
    runtime.spawn_background_tasks();

    let control = tokio::spawn({
        let runtime = runtime.clone();
        async move {
            if let Err(e) = ipc::serve(runtime, &listen_path).await {
                error!("control channel stopped: {e}");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    runtime.shutdown();
    control.abort();

    info!("agentmesh core stopped");
    Ok(())
}

fn print_response(response: ipc::Response) {
    match response {
        ipc::Response::Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default()),
        ipc::Response::Err(message) => eprintln!("error: {message}"),
    }
}
