use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use forkflight_core::{ClientConfig, FlightLocation, ServerConfig};
use serde::{Deserialize, Serialize};

/// Settings loaded from `--config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Server settings with an optional `--address` override
    pub fn server_config(&self, address: Option<&str>) -> Result<ServerConfig> {
        let mut server = self.server.clone();
        if let Some(address) = address {
            server.location = FlightLocation::parse(address)?;
        }
        Ok(server)
    }

    /// Client settings with command-line overrides applied
    pub fn client_config(&self, overrides: &ClientOverrides) -> Result<ClientConfig> {
        let mut client = self.client.clone();
        if let Some(address) = &overrides.address {
            client.location = FlightLocation::parse(address)?;
        }
        if let Some(ms) = overrides.connect_timeout_ms {
            client = client.with_connect_timeout(Some(Duration::from_millis(ms)));
        }
        if let Some(ms) = overrides.request_timeout_ms {
            client = client.with_request_timeout(Some(Duration::from_millis(ms)));
        }
        Ok(client)
    }
}

/// Client flags shared by every listing command
#[derive(Debug, Clone, Default, Args)]
pub struct ClientOverrides {
    /// Server location (scheme://host:port)
    #[arg(short, long)]
    pub address: Option<String>,

    /// Connect deadline in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Per-request deadline in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,
}
