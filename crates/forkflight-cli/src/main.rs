use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod harness;

use commands::*;
use config::{ClientOverrides, Config};
use harness::{fork_workers, spawn_workers, ForkPolicy};

#[derive(Parser)]
#[command(name = "forkflight")]
#[command(author, version, about = "Flight listing server and fork fan-out harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Flight listing server with the sample dataset
    Server {
        /// Location to bind (scheme://host:port)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// List flights once from this process
    List {
        #[command(flatten)]
        client: ClientOverrides,
    },

    /// List flights from re-executed worker processes
    Spawn {
        /// Number of worker processes
        #[arg(short, long, default_value = "2")]
        workers: usize,

        #[command(flatten)]
        client: ClientOverrides,
    },

    /// Connect, fork, and list flights from parent and children
    Fork {
        /// Number of forked children
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// What children do with the parent's connection
        #[arg(short, long, value_enum, default_value_t = ForkPolicy::Shared)]
        policy: ForkPolicy,

        #[command(flatten)]
        client: ClientOverrides,
    },

    /// Worker entry point used by `spawn`
    #[command(hide = true)]
    Worker {
        /// Client configuration as JSON
        #[arg(long)]
        client_config: String,
    },
}

// No `#[tokio::main]`: a runtime must not be running when the harness forks,
// so each command builds the runtime it needs.
fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose)?;

    // Load configuration
    let config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Server { address } => {
            start_server(config.server_config(address.as_deref())?)?;
        }
        Commands::List { client } => {
            list_flights(&config.client_config(&client)?)?;
        }
        Commands::Spawn { workers, client } => {
            spawn_workers(&config.client_config(&client)?, workers)?;
        }
        Commands::Fork {
            workers,
            policy,
            client,
        } => {
            fork_workers(&config.client_config(&client)?, workers, policy)?;
        }
        Commands::Worker { client_config } => {
            run_worker(&client_config)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "forkflight=debug,forkflight_flight=debug,forkflight_core=debug"
    } else {
        "forkflight=info,forkflight_flight=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
