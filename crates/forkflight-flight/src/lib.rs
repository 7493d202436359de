//! Arrow Flight listing server and fork-aware client
//!
//! The server streams one `FlightInfo` per registered dataset over the
//! Flight `ListFlights` RPC. The client ties every connection to the process
//! that opened it, so a connection inherited across `fork()` fails with
//! `StaleConnectionError` instead of racing the parent on a shared socket.
//!
//! # Example
//!
//! ```ignore
//! use forkflight_core::{ClientConfig, ServerConfig};
//! use forkflight_flight::{Connection, ListingServer};
//!
//! let handle = ListingServer::with_sample_dataset(ServerConfig::default())?
//!     .start()
//!     .await?;
//!
//! let connection = Connection::connect(&ClientConfig::default()).await?;
//! for name in connection.list_flight_names().await? {
//!     println!("[PID: {}]: got flightinfo for '{}'", std::process::id(), name);
//! }
//! handle.stop().await?;
//! ```

pub mod client;
pub mod error;
pub mod process;
pub mod server;

pub use client::{flight_name, Connection, ConnectionFactory, FlightListing, ProcessLocalClient};
pub use error::ListingError;
pub use process::ProcessIdentity;
pub use server::{make_flight_info, ListingServer, ListingService, ServerHandle};

/// Result type for listing operations
pub type Result<T> = std::result::Result<T, ListingError>;
