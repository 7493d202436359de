use anyhow::Result;
use arrow_flight::Criteria;
use colored::Colorize;
use forkflight_core::{ClientConfig, ServerConfig};
use forkflight_flight::{flight_name, Connection, ListingError, ListingServer};
use tokio::runtime::{Builder, Runtime};
use tracing::info;

/// Runtime for client work: a single thread, nothing running between calls
pub fn client_runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

/// Print one line per flight, tagged with the calling process id
pub async fn print_flights(connection: &Connection) -> Result<usize, ListingError> {
    let pid = std::process::id();
    println!("[PID: {}]: list_all_flights() called", pid);

    let mut listing = connection.list_flights(Criteria::default()).await?;
    while let Some(info) = listing.next().await? {
        let name = flight_name(&info).unwrap_or_else(|| "<unnamed>".to_string());
        println!("[PID: {}]: got flightinfo for '{}'", pid, name);
    }

    Ok(listing.received())
}

/// Serve the sample dataset until Ctrl-C
pub fn start_server(config: ServerConfig) -> Result<()> {
    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let handle = ListingServer::with_sample_dataset(config)?.start().await?;
        println!(
            "{}",
            format!("[SERVER] Starting FlightServer on {}", handle.location()).bright_green()
        );

        tokio::signal::ctrl_c().await?;
        println!("{}", "[SERVER] Shutting down".bright_yellow());
        handle.stop().await?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Connect and list once from this process
pub fn list_flights(config: &ClientConfig) -> Result<()> {
    let runtime = client_runtime()?;
    let count = runtime.block_on(async {
        let connection = Connection::connect(config).await?;
        print_flights(&connection).await
    })?;

    info!("Listed {} flights from {}", count, config.location);
    Ok(())
}

/// Entry point of a re-executed worker process
pub fn run_worker(client_config: &str) -> Result<()> {
    let config = ClientConfig::from_json(client_config)?;
    info!(pid = std::process::id(), "worker started");
    list_flights(&config)
}
