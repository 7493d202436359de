//! Flight locations
//!
//! A location is the `scheme://host:port` address a server listens on and
//! advertises in its endpoints. Only the plaintext gRPC schemes are
//! accepted; the client always speaks HTTP/2 without TLS.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Address the reproduction server has always listened on
pub const DEFAULT_LOCATION: &str = "grpc://0.0.0.0:8815";

const SCHEMES: &[&str] = &["grpc", "grpc+tcp", "http"];

/// A parsed `scheme://host:port` address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlightLocation {
    scheme: String,
    host: String,
    port: u16,
}

impl FlightLocation {
    /// Parse a location string
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| CoreError::InvalidLocation(format!("missing scheme in '{}'", input)))?;

        let scheme = scheme.to_ascii_lowercase();
        if !SCHEMES.contains(&scheme.as_str()) {
            return Err(CoreError::InvalidLocation(format!(
                "unsupported scheme '{}' (expected one of {})",
                scheme,
                SCHEMES.join(", ")
            )));
        }

        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.contains('/') {
            return Err(CoreError::InvalidLocation(format!(
                "unexpected path in '{}'",
                input
            )));
        }

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| CoreError::InvalidLocation(format!("expected host:port in '{}'", input)))?;

        if host.is_empty() {
            return Err(CoreError::InvalidLocation(format!("empty host in '{}'", input)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| CoreError::InvalidLocation(format!("invalid port '{}'", port)))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same location on a different port (used once an ephemeral port is bound)
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// `host:port`, suitable for binding or resolving
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The URI handed to the gRPC transport
    pub fn http_uri(&self) -> String {
        format!("http://{}", self.authority())
    }
}

fn split_host_port(authority: &str) -> Option<(&str, &str)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        Some((host, port))
    } else {
        authority.rsplit_once(':')
    }
}

impl Default for FlightLocation {
    fn default() -> Self {
        Self {
            scheme: "grpc".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8815,
        }
    }
}

impl fmt::Display for FlightLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl FromStr for FlightLocation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FlightLocation {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FlightLocation> for String {
    fn from(location: FlightLocation) -> Self {
        location.to_string()
    }
}
