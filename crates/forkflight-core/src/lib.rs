//! Core types for forkflight
//!
//! Shared by the listing server and the client: the in-memory dataset
//! registry, Flight locations (`scheme://host:port`) and the serializable
//! server/client configuration.

pub mod config;
pub mod dataset;
pub mod error;
pub mod location;

pub use config::{ClientConfig, ServerConfig};
pub use dataset::{Dataset, DatasetRegistry, SAMPLE_DATASET_NAME};
pub use error::{CoreError, Result};
pub use location::{FlightLocation, DEFAULT_LOCATION};
