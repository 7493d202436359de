//! Error types for the listing server and client

use std::time::Duration;

use forkflight_core::CoreError;
use thiserror::Error;
use tonic::Code;

/// Errors that can occur while serving or listing flights
#[derive(Debug, Error)]
pub enum ListingError {
    /// The server could not acquire its listening address
    #[error("Bind error on {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The server could not be reached
    #[error("Connect error to {address}: {message}")]
    ConnectError { address: String, message: String },

    /// A connection was used from a process other than the one that created it
    #[error("Stale connection: created by process {owner}, used from process {current}")]
    StaleConnectionError { owner: u32, current: u32 },

    /// A connect or request deadline expired
    #[error("Timeout: {operation} did not complete within {timeout:?}")]
    TimeoutError {
        operation: &'static str,
        timeout: Duration,
    },

    /// The transport failed after a listing had started
    #[error("Stream terminated: {0}")]
    StreamTerminationError(tonic::Status),

    /// Malformed server location
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// gRPC status returned by the initial call
    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    /// gRPC transport error
    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ListingError {
    pub fn is_stale(&self) -> bool {
        matches!(self, ListingError::StaleConnectionError { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ListingError::TimeoutError { .. })
    }

    /// Classify a status received from the transport
    ///
    /// Deadline statuses become `TimeoutError`. Anything else is a
    /// `GrpcError` when the call itself is rejected and a
    /// `StreamTerminationError` when it arrives while reading the response
    /// stream, whether or not any record was received.
    pub(crate) fn from_status(
        status: tonic::Status,
        operation: &'static str,
        timeout: Option<Duration>,
        streaming: bool,
    ) -> Self {
        if let Some(timeout) = timeout {
            if is_deadline_status(&status) {
                return ListingError::TimeoutError { operation, timeout };
            }
        }

        if streaming {
            ListingError::StreamTerminationError(status)
        } else {
            ListingError::GrpcError(status)
        }
    }
}

/// tonic reports its own client-side deadline as `Cancelled("Timeout expired")`
fn is_deadline_status(status: &tonic::Status) -> bool {
    match status.code() {
        Code::DeadlineExceeded => true,
        Code::Cancelled => status.message().contains("Timeout expired"),
        _ => false,
    }
}

impl From<ListingError> for tonic::Status {
    fn from(err: ListingError) -> Self {
        match err {
            ListingError::BindError { .. } => tonic::Status::internal(err.to_string()),
            ListingError::ConnectError { .. } => tonic::Status::unavailable(err.to_string()),
            ListingError::StaleConnectionError { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
            ListingError::TimeoutError { .. } => tonic::Status::deadline_exceeded(err.to_string()),
            ListingError::StreamTerminationError(status) => status,
            ListingError::InvalidAddress(msg) => tonic::Status::invalid_argument(msg),
            ListingError::GrpcError(status) => status,
            ListingError::TransportError(e) => tonic::Status::unavailable(e.to_string()),
            ListingError::ArrowError(e) => tonic::Status::internal(e.to_string()),
            ListingError::IoError(e) => tonic::Status::internal(e.to_string()),
            ListingError::Internal(msg) => tonic::Status::internal(msg),
        }
    }
}

impl From<CoreError> for ListingError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidLocation(msg) => ListingError::InvalidAddress(msg),
            CoreError::ArrowError(e) => ListingError::ArrowError(e),
            CoreError::IoError(e) => ListingError::IoError(e),
            other => ListingError::Internal(other.to_string()),
        }
    }
}
