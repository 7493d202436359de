//! Server and client configuration
//!
//! Both structs are plain serializable values. A `ClientConfig` is what a
//! worker process receives instead of a live connection: every process
//! builds its own transport from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::location::FlightLocation;

/// Configuration for the listing server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Location to bind and advertise in flight endpoints
    pub location: FlightLocation,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            location: FlightLocation::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(location: FlightLocation) -> Self {
        Self { location }
    }
}

/// Configuration for a listing client connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server location
    pub location: FlightLocation,
    /// Deadline for establishing the transport
    pub connect_timeout_ms: Option<u64>,
    /// Deadline for one whole `ListFlights` call, including every streamed record
    pub request_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            location: FlightLocation::default(),
            connect_timeout_ms: Some(5_000),
            request_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn new(location: FlightLocation) -> Self {
        Self {
            location,
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout_ms = timeout.map(duration_to_millis);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(duration_to_millis);
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
