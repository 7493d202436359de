//! Fork-aware Arrow Flight listing client
//!
//! A [`Connection`] belongs to the process that created it. After `fork()`
//! the child inherits the struct, its socket descriptors and a copy of the
//! runtime state, but none of the threads driving them, while the parent
//! keeps reading the same socket. Every call therefore checks the calling
//! process first and fails with `StaleConnectionError` instead of touching
//! the transport. Dropping a stale connection leaks the inherited channel
//! for the same reason.
//!
//! Workers should carry a [`ClientConfig`] (or a [`ConnectionFactory`]) and
//! connect after the fork. [`ProcessLocalClient`] does that explicitly: it
//! discards a cached connection that turned stale and reconnects.

use std::time::Duration;

use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{Criteria, FlightDescriptor, FlightInfo, HandshakeRequest};
use futures::stream::{self, Stream};
use futures::Future;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Streaming};
use tracing::{debug, info, warn};

use forkflight_core::{ClientConfig, FlightLocation};

use crate::error::ListingError;
use crate::process::ProcessIdentity;

/// Deadline for one request: absolute expiry plus the configured duration
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(|timeout| Self {
            at: Instant::now() + timeout,
            timeout,
        })
    }
}

async fn with_deadline<F, T>(
    deadline: Option<Deadline>,
    operation: &'static str,
    future: F,
) -> Result<T, ListingError>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, future)
            .await
            .map_err(|_| ListingError::TimeoutError {
                operation,
                timeout: deadline.timeout,
            }),
        None => Ok(future.await),
    }
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Connection to a listing server, owned by the process that created it
pub struct Connection {
    client: Option<FlightServiceClient<Channel>>,
    owner: ProcessIdentity,
    location: FlightLocation,
    request_timeout: Option<Duration>,
}

impl Connection {
    /// Connect to the server described by `config`
    pub async fn connect(config: &ClientConfig) -> Result<Self, ListingError> {
        let location = config.location.clone();
        info!("Connecting to Flight server at {}", location);

        let endpoint = Endpoint::from_shared(location.http_uri())
            .map_err(|e| ListingError::InvalidAddress(e.to_string()))?;

        let connect_timeout = config.connect_timeout();
        let channel = with_deadline(Deadline::after(connect_timeout), "connect", endpoint.connect())
            .await?
            .map_err(|e| ListingError::ConnectError {
                address: location.to_string(),
                message: error_chain(&e),
            })?;

        let owner = ProcessIdentity::current();
        debug!(pid = owner.pid(), "connected to {}", location);

        Ok(Self {
            client: Some(FlightServiceClient::new(channel)),
            owner,
            location,
            request_timeout: config.request_timeout(),
        })
    }

    /// Connect to `location` with default timeouts
    pub async fn connect_to(location: &str) -> Result<Self, ListingError> {
        let location = FlightLocation::parse(location)?;
        Self::connect(&ClientConfig::new(location)).await
    }

    pub fn location(&self) -> &FlightLocation {
        &self.location
    }

    /// Id of the process that created this connection
    pub fn owner_pid(&self) -> u32 {
        self.owner.pid()
    }

    /// Whether this connection was created in another process
    pub fn is_stale(&self) -> bool {
        !self.owner.is_current()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Override the per-request deadline for subsequent calls
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    /// A client handle for one call, after checking the calling process
    fn client(&self) -> Result<FlightServiceClient<Channel>, ListingError> {
        self.owner.check()?;
        self.client
            .clone()
            .ok_or_else(|| ListingError::Internal("connection already closed".to_string()))
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(timeout) = self.request_timeout {
            request.set_timeout(timeout);
        }
        request
    }

    /// Issue one `ListFlights` request
    ///
    /// The returned listing is lazy and cannot be restarted; call again for
    /// a fresh request. Listings from the same connection are independent.
    pub async fn list_flights(&self, criteria: Criteria) -> Result<FlightListing, ListingError> {
        let mut client = self.client()?;
        let deadline = Deadline::after(self.request_timeout);

        debug!(pid = self.owner.pid(), "list_flights on {}", self.location);
        let response = with_deadline(
            deadline,
            "list_flights",
            client.list_flights(self.request(criteria)),
        )
        .await?
        .map_err(|status| {
            ListingError::from_status(status, "list_flights", self.request_timeout, false)
        })?;

        Ok(FlightListing {
            stream: Some(response.into_inner()),
            owner: self.owner,
            deadline,
            received: 0,
            finished: false,
        })
    }

    /// List every flight and collect the results
    pub async fn list_all(&self) -> Result<Vec<FlightInfo>, ListingError> {
        self.list_flights(Criteria::default()).await?.collect().await
    }

    /// First path segment of every listed flight
    pub async fn list_flight_names(&self) -> Result<Vec<String>, ListingError> {
        let flights = self.list_all().await?;
        Ok(flights.iter().filter_map(flight_name).collect())
    }

    /// Flight info for a single descriptor
    pub async fn get_flight_info(
        &self,
        descriptor: FlightDescriptor,
    ) -> Result<FlightInfo, ListingError> {
        let mut client = self.client()?;
        let deadline = Deadline::after(self.request_timeout);

        let response = with_deadline(
            deadline,
            "get_flight_info",
            client.get_flight_info(self.request(descriptor)),
        )
        .await?
        .map_err(|status| {
            ListingError::from_status(status, "get_flight_info", self.request_timeout, false)
        })?;

        Ok(response.into_inner())
    }

    /// Perform the (unauthenticated) handshake
    pub async fn handshake(&self) -> Result<(), ListingError> {
        let mut client = self.client()?;
        let deadline = Deadline::after(self.request_timeout);
        let request = HandshakeRequest {
            protocol_version: 0,
            payload: Default::default(),
        };

        with_deadline(deadline, "handshake", async {
            let response = client
                .handshake(self.request(stream::once(async { request })))
                .await?;
            let mut stream = response.into_inner();
            while stream.message().await?.is_some() {}
            Ok::<(), tonic::Status>(())
        })
        .await?
        .map_err(|status| {
            ListingError::from_status(status, "handshake", self.request_timeout, false)
        })?;

        debug!("Handshake completed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_stale() {
            // Dropping the channel would wake the parent's runtime and close
            // descriptors it still uses.
            std::mem::forget(self.client.take());
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("location", &self.location)
            .field("owner", &self.owner)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// First path segment of a flight descriptor
pub fn flight_name(info: &FlightInfo) -> Option<String> {
    info.flight_descriptor
        .as_ref()
        .and_then(|descriptor| descriptor.path.first().cloned())
}

/// Lazy result of one `ListFlights` call
///
/// Records arrive in server registration order. `next` returns `Ok(None)`
/// once the server ends the stream. Dropping the listing early cancels the
/// call without affecting the connection.
pub struct FlightListing {
    stream: Option<Streaming<FlightInfo>>,
    owner: ProcessIdentity,
    deadline: Option<Deadline>,
    received: usize,
    finished: bool,
}

impl FlightListing {
    /// Pull the next record
    pub async fn next(&mut self) -> Result<Option<FlightInfo>, ListingError> {
        self.owner.check()?;
        if self.finished {
            return Ok(None);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let message = match with_deadline(self.deadline, "list_flights", stream.message()).await {
            Ok(message) => message,
            Err(err) => {
                self.finished = true;
                return Err(err);
            }
        };

        match message {
            Ok(Some(info)) => {
                self.received += 1;
                Ok(Some(info))
            }
            Ok(None) => {
                self.finished = true;
                debug!(received = self.received, "list_flights stream complete");
                Ok(None)
            }
            Err(status) => {
                self.finished = true;
                warn!(
                    received = self.received,
                    "list_flights stream terminated: {}", status
                );
                let timeout = self.deadline.map(|d| d.timeout);
                Err(ListingError::from_status(status, "list_flights", timeout, true))
            }
        }
    }

    /// Number of records pulled so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Whether the end of the stream (or an error) has been reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drain the remaining records
    pub async fn collect(mut self) -> Result<Vec<FlightInfo>, ListingError> {
        let mut flights = Vec::new();
        while let Some(info) = self.next().await? {
            flights.push(info);
        }
        Ok(flights)
    }

    /// Adapt into a `Stream` that ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<FlightInfo, ListingError>> {
        stream::try_unfold(self, |mut listing| async move {
            Ok(listing.next().await?.map(|info| (info, listing)))
        })
    }
}

impl Drop for FlightListing {
    fn drop(&mut self) {
        if !self.owner.is_current() {
            std::mem::forget(self.stream.take());
        }
    }
}

/// Builds connections from a serializable configuration
///
/// A factory holds no transport state, so it is safe to create before a
/// fork and use on both sides of it.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    config: ClientConfig,
}

impl ConnectionFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a new connection owned by the calling process
    pub async fn connect(&self) -> Result<Connection, ListingError> {
        Connection::connect(&self.config).await
    }
}

/// A connection cache that reconnects after the owning process changes
///
/// This is the explicit recovery path: a raw [`Connection`] always fails
/// with `StaleConnectionError` in a forked child, while this wrapper notices
/// the new process id before any call, abandons the inherited connection
/// and builds a fresh one from its factory.
#[derive(Debug)]
pub struct ProcessLocalClient {
    factory: ConnectionFactory,
    connection: Option<Connection>,
    reconnects: usize,
}

impl ProcessLocalClient {
    /// Lazy client; nothing is connected until first use
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            connection: None,
            reconnects: 0,
        }
    }

    /// Client seeded with an existing connection
    pub fn with_connection(factory: ConnectionFactory, connection: Connection) -> Self {
        Self {
            factory,
            connection: Some(connection),
            reconnects: 0,
        }
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// Number of stale connections replaced so far
    pub fn reconnects(&self) -> usize {
        self.reconnects
    }

    /// The cached connection as-is, stale or not
    pub fn cached(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// A connection owned by the calling process, connecting if needed
    pub async fn connection(&mut self) -> Result<&Connection, ListingError> {
        if self.connection.as_ref().is_some_and(Connection::is_stale) {
            if let Some(stale) = self.connection.take() {
                warn!(
                    owner = stale.owner_pid(),
                    current = std::process::id(),
                    "discarding connection inherited from another process"
                );
                self.reconnects += 1;
                drop(stale);
            }
        }

        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.factory.connect().await?,
        };
        Ok(self.connection.insert(connection))
    }

    /// `list_flights` on a process-local connection
    pub async fn list_flights(&mut self, criteria: Criteria) -> Result<FlightListing, ListingError> {
        self.connection().await?.list_flights(criteria).await
    }

    /// Names of every listed flight on a process-local connection
    pub async fn list_flight_names(&mut self) -> Result<Vec<String>, ListingError> {
        self.connection().await?.list_flight_names().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ListingServer, ServerHandle};
    use forkflight_core::{DatasetRegistry, ServerConfig};

    async fn start_server() -> ServerHandle {
        let config = ServerConfig::new(FlightLocation::parse("grpc://127.0.0.1:0").unwrap());
        ListingServer::new(config, DatasetRegistry::sample().unwrap())
            .start()
            .await
            .unwrap()
    }

    fn client_config(handle: &ServerHandle) -> ClientConfig {
        ClientConfig::new(handle.location().clone())
    }

    /// Pretend `connection` was inherited from another process
    fn make_foreign(connection: &mut Connection) {
        connection.owner = ProcessIdentity::from_pid(std::process::id().wrapping_add(1));
    }

    #[tokio::test]
    async fn test_invalid_connection() {
        let result = Connection::connect_to("grpc://127.0.0.1:99999").await;
        assert!(matches!(result, Err(ListingError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_connect_and_list() {
        let server = start_server().await;
        let connection = Connection::connect(&client_config(&server)).await.unwrap();

        assert_eq!(connection.owner_pid(), std::process::id());
        assert!(!connection.is_stale());
        assert_eq!(connection.list_flight_names().await.unwrap(), vec!["fork_test_tbl"]);
        connection.handshake().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_connection_fails_fast() {
        let server = start_server().await;
        let mut connection = Connection::connect(&client_config(&server)).await.unwrap();
        make_foreign(&mut connection);

        assert!(connection.is_stale());
        let err = connection.list_flights(Criteria::default()).await.err().unwrap();
        match err {
            ListingError::StaleConnectionError { owner, current } => {
                assert_eq!(current, std::process::id());
                assert_ne!(owner, current);
            }
            other => panic!("expected stale connection, got {:?}", other),
        }

        // stays stale on every call
        assert!(connection.list_all().await.unwrap_err().is_stale());
        assert!(connection.handshake().await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn test_stale_listing_refuses_to_read() {
        let server = start_server().await;
        let connection = Connection::connect(&client_config(&server)).await.unwrap();
        let mut listing = connection.list_flights(Criteria::default()).await.unwrap();

        listing.owner = ProcessIdentity::from_pid(std::process::id().wrapping_add(1));
        assert!(listing.next().await.unwrap_err().is_stale());
        assert_eq!(listing.received(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_listing_still_checks_owner() {
        let server = start_server().await;
        let connection = Connection::connect(&client_config(&server)).await.unwrap();
        let mut listing = connection.list_flights(Criteria::default()).await.unwrap();
        while listing.next().await.unwrap().is_some() {}
        assert!(listing.is_finished());

        listing.owner = ProcessIdentity::from_pid(std::process::id().wrapping_add(1));
        assert!(listing.next().await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn test_handshake_honours_request_timeout() {
        let server = start_server().await;
        let mut connection = Connection::connect(&client_config(&server)).await.unwrap();

        connection.set_request_timeout(Some(Duration::from_nanos(1)));
        let err = connection.handshake().await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);

        connection.set_request_timeout(None);
        connection.handshake().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_local_client_reconnects() {
        let server = start_server().await;
        let factory = ConnectionFactory::new(client_config(&server));
        let mut connection = factory.connect().await.unwrap();
        make_foreign(&mut connection);

        let mut client = ProcessLocalClient::with_connection(factory, connection);
        assert!(client.cached().unwrap().is_stale());
        assert_eq!(client.list_flight_names().await.unwrap(), vec!["fork_test_tbl"]);
        assert_eq!(client.reconnects(), 1);

        // the replacement is owned by this process and reused
        assert_eq!(client.connection().await.unwrap().owner_pid(), std::process::id());
        client.list_flight_names().await.unwrap();
        assert_eq!(client.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_process_local_client_is_lazy() {
        let server = start_server().await;
        let mut client = ProcessLocalClient::new(ConnectionFactory::new(client_config(&server)));
        assert!(client.cached().is_none());

        let mut listing = client.list_flights(Criteria::default()).await.unwrap();
        assert!(listing.next().await.unwrap().is_some());
        assert!(listing.next().await.unwrap().is_none());
        assert!(listing.is_finished());
        assert_eq!(client.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_listing_as_stream() {
        use futures::TryStreamExt;

        let server = start_server().await;
        let connection = Connection::connect(&client_config(&server)).await.unwrap();
        let flights: Vec<FlightInfo> = connection
            .list_flights(Criteria::default())
            .await
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(flights.len(), 1);
        assert_eq!(flight_name(&flights[0]).as_deref(), Some("fork_test_tbl"));
    }

    #[test]
    fn test_error_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(error_chain(&io), "refused");
    }
}
