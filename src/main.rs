use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use hearth::config::MasterConfig;
use hearth::monitor::clients::{send_request, ClientRequest, ClientResponse};
use hearth::plan::Plan;
use hearth::reactor::Reactor;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(about = "Preforking process-tree master that keeps application state warm", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the stage tree from a plan and run the master loop
    Start {
        /// Path to the plan file
        #[arg(short, long, default_value = "hearth.json")]
        plan: PathBuf,

        /// Coordination socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Show the live stage tree of a running master
    Status {
        /// Coordination socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Stop a running master
    Stop {
        /// Coordination socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Validate a plan file without booting it
    Check {
        /// Path to the plan file
        plan: PathBuf,
    },
}

fn master_config(socket: Option<PathBuf>) -> MasterConfig {
    let mut config = MasterConfig::default();
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    config
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { plan, socket } => {
            let plan = Plan::load(&plan)?;
            let config = master_config(socket);
            Reactor::new(plan, config)?.run()
        }
        Commands::Status { socket } => {
            let config = master_config(socket);
            match send_request(&config.socket_path, &ClientRequest::Status)? {
                ClientResponse::Status { stages } => {
                    for stage in stages {
                        let pid = stage
                            .pid
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<20} {:<10} {:<9} pid {:<8} {} deps",
                            stage.name, stage.process_type, stage.state, pid, stage.dependencies
                        );
                    }
                    Ok(())
                }
                ClientResponse::Error { message } => bail!("Master returned error: {message}"),
                other => bail!("Unexpected response from master: {other:?}"),
            }
        }
        Commands::Stop { socket } => {
            let config = master_config(socket);
            match send_request(&config.socket_path, &ClientRequest::Stop)? {
                ClientResponse::Ok => {
                    println!("stop requested");
                    Ok(())
                }
                ClientResponse::Error { message } => bail!("Master returned error: {message}"),
                other => bail!("Unexpected response from master: {other:?}"),
            }
        }
        Commands::Check { plan } => {
            let plan = Plan::load(&plan)?;
            println!("plan OK: {} stages rooted at '{}'", plan.len(), plan.root().name);
            Ok(())
        }
    }
}
