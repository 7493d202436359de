//! Arrow Flight listing server
//!
//! Serves the metadata of an immutable dataset registry over the Flight
//! `ListFlights` RPC. Listings are produced lazily from a shared registry so
//! concurrent requests never interfere, and a client that walks away simply
//! drops the remaining stream.

use std::net::SocketAddr;

use arrow::error::ArrowError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaAsIpc, SchemaResult, Ticket,
};
use arrow_ipc::writer::IpcWriteOptions;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use forkflight_core::{Dataset, DatasetRegistry, FlightLocation, ServerConfig};

use crate::error::ListingError;

/// Build the `FlightInfo` advertised for one dataset
///
/// The descriptor path is the dataset name, the single endpoint carries the
/// name as its ticket and points back at `location`. The byte size is never
/// computed and is reported as unknown (`-1`).
pub fn make_flight_info(
    dataset: &Dataset,
    location: &FlightLocation,
) -> Result<FlightInfo, ArrowError> {
    let descriptor = FlightDescriptor::new_path(vec![dataset.name().to_string()]);
    let endpoint = FlightEndpoint::new()
        .with_ticket(Ticket::new(dataset.name().to_string()))
        .with_location(location.to_string());
    let total_records = i64::try_from(dataset.num_rows()).unwrap_or(-1);

    Ok(FlightInfo::new()
        .try_with_schema(dataset.schema())?
        .with_descriptor(descriptor)
        .with_endpoint(endpoint)
        .with_total_records(total_records)
        .with_total_bytes(-1))
}

/// Flight listing server
pub struct ListingServer {
    config: ServerConfig,
    registry: DatasetRegistry,
}

impl ListingServer {
    /// Create a server for `registry`; nothing is bound until [`start`](Self::start)
    pub fn new(config: ServerConfig, registry: DatasetRegistry) -> Self {
        Self { config, registry }
    }

    /// Server holding the five-row `fork_test_tbl` dataset
    pub fn with_sample_dataset(config: ServerConfig) -> Result<Self, ListingError> {
        Ok(Self::new(config, DatasetRegistry::sample()?))
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// Bind the configured location and serve in the background
    ///
    /// Binding happens before this returns, so an address already in use or
    /// an unresolvable host is reported here as `BindError`.
    pub async fn start(self) -> Result<ServerHandle, ListingError> {
        let location = self.config.location;
        let listener = TcpListener::bind(location.authority())
            .await
            .map_err(|source| ListingError::BindError {
                address: location.to_string(),
                source,
            })?;

        let local_addr = listener.local_addr()?;
        let advertised = location.with_port(local_addr.port());
        let service = ListingService::new(self.registry, advertised.clone());

        info!(
            "Listing server ready on {} ({} datasets)",
            advertised,
            service.registry().len()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            Server::builder()
                .add_service(FlightServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(ServerHandle {
            local_addr,
            location: advertised,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Handle to a running listing server
///
/// Dropping the handle signals shutdown without waiting for it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    location: FlightLocation,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
}

impl ServerHandle {
    /// The socket address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The location advertised in flight endpoints
    pub fn location(&self) -> &FlightLocation {
        &self.location
    }

    /// Stop accepting connections and wait for in-flight requests to finish
    pub async fn stop(mut self) -> Result<(), ListingError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        let Some(task) = self.task.take() else {
            return Ok(());
        };

        task.await
            .map_err(|e| ListingError::Internal(format!("server task failed: {}", e)))??;

        info!("Listing server on {} stopped", self.location);
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Flight service answering listing requests
#[derive(Clone)]
pub struct ListingService {
    registry: DatasetRegistry,
    location: FlightLocation,
}

impl ListingService {
    /// Create a service advertising `location` in its endpoints
    pub fn new(registry: DatasetRegistry, location: FlightLocation) -> Self {
        Self { registry, location }
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn location(&self) -> &FlightLocation {
        &self.location
    }

    /// Resolve a descriptor to a registered dataset
    ///
    /// Path descriptors name the dataset in their single segment; command
    /// descriptors are read as a UTF-8 dataset name.
    fn dataset_for(&self, descriptor: &FlightDescriptor) -> Result<&Dataset, Status> {
        let name = if !descriptor.path.is_empty() {
            match descriptor.path.as_slice() {
                [name] => name.clone(),
                path => {
                    return Err(Status::invalid_argument(format!(
                        "Descriptor path must have exactly one segment, got {}",
                        path.len()
                    )))
                }
            }
        } else if !descriptor.cmd.is_empty() {
            String::from_utf8(descriptor.cmd.to_vec())
                .map_err(|_| Status::invalid_argument("Descriptor command is not UTF-8"))?
        } else {
            return Err(Status::invalid_argument("No dataset specified"));
        };

        self.registry
            .get(&name)
            .ok_or_else(|| Status::not_found(format!("Dataset not found: {}", name)))
    }

    /// Decode the criteria expression into a dataset-name prefix
    fn name_prefix(criteria: &Criteria) -> Result<Option<String>, Status> {
        if criteria.expression.is_empty() {
            return Ok(None);
        }

        String::from_utf8(criteria.expression.to_vec())
            .map(Some)
            .map_err(|_| Status::invalid_argument("Criteria expression is not UTF-8"))
    }
}

#[tonic::async_trait]
impl FlightService for ListingService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    /// No authentication; answers with an empty payload
    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        let response = HandshakeResponse {
            protocol_version: 0,
            payload: Default::default(),
        };
        let stream = stream::once(async { Ok(response) }).boxed();
        Ok(Response::new(stream))
    }

    /// Stream one `FlightInfo` per dataset, in registration order
    async fn list_flights(
        &self,
        request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        let peer = request.remote_addr();
        let prefix = Self::name_prefix(request.get_ref())?;
        info!(?peer, ?prefix, "received list_flights");

        let registry = self.registry.clone();
        let location = self.location.clone();
        let flights = (0..registry.len()).filter_map(move |index| {
            let dataset = registry.get_index(index)?;
            if let Some(prefix) = &prefix {
                if !dataset.name().starts_with(prefix.as_str()) {
                    return None;
                }
            }

            debug!(dataset = dataset.name(), "sending flight info");
            Some(make_flight_info(dataset, &location).map_err(|e| {
                warn!(dataset = dataset.name(), "failed to build flight info: {}", e);
                Status::internal(e.to_string())
            }))
        });

        Ok(Response::new(stream::iter(flights).boxed()))
    }

    /// Flight info for a single dataset
    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = request.into_inner();
        let dataset = self.dataset_for(&descriptor)?;

        let info = make_flight_info(dataset, &self.location)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info is not supported"))
    }

    /// IPC-encoded schema of a single dataset
    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        let descriptor = request.into_inner();
        let dataset = self.dataset_for(&descriptor)?;

        let options = IpcWriteOptions::default();
        let schema_as_ipc = SchemaAsIpc::new(dataset.schema(), &options);
        let result: SchemaResult = schema_as_ipc
            .try_into()
            .map_err(|e: ArrowError| Status::internal(e.to_string()))?;

        Ok(Response::new(result))
    }

    async fn do_get(
        &self,
        _request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        Err(Status::unimplemented("do_get is not supported"))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put is not supported"))
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented(format!(
            "Unknown action: {}",
            request.into_inner().r#type
        )))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Ok(Response::new(stream::empty().boxed()))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn location() -> FlightLocation {
        FlightLocation::parse("grpc://127.0.0.1:8815").unwrap()
    }

    fn dataset(name: &str, rows: i64) -> Dataset {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from_iter_values(0..rows))])
                .unwrap();
        Dataset::from_batch(name, batch)
    }

    fn service(datasets: Vec<Dataset>) -> ListingService {
        ListingService::new(DatasetRegistry::new(datasets).unwrap(), location())
    }

    async fn list(service: &ListingService, expression: &str) -> Vec<FlightInfo> {
        let criteria = Criteria {
            expression: expression.as_bytes().to_vec().into(),
        };
        service
            .list_flights(Request::new(criteria))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap()
    }

    #[test]
    fn test_make_flight_info() {
        let dataset = Dataset::sample().unwrap();
        let info = make_flight_info(&dataset, &location()).unwrap();

        assert_eq!(info.total_records, 5);
        assert_eq!(info.total_bytes, -1);

        let descriptor = info.flight_descriptor.clone().unwrap();
        assert_eq!(descriptor.path, vec!["fork_test_tbl".to_string()]);

        assert_eq!(info.endpoint.len(), 1);
        let endpoint = &info.endpoint[0];
        assert_eq!(&endpoint.ticket.as_ref().unwrap().ticket[..], &b"fork_test_tbl"[..]);
        assert_eq!(endpoint.location[0].uri, "grpc://127.0.0.1:8815");

        let schema = info.try_decode_schema().unwrap();
        assert_eq!(schema.fields().len(), 3);
    }

    #[tokio::test]
    async fn test_list_flights_in_registration_order() {
        let service = service(vec![dataset("b", 2), dataset("a", 1), dataset("c", 3)]);
        let flights = list(&service, "").await;

        let paths: Vec<_> = flights
            .iter()
            .map(|f| f.flight_descriptor.as_ref().unwrap().path[0].clone())
            .collect();
        assert_eq!(paths, vec!["b", "a", "c"]);

        let rows: Vec<_> = flights.iter().map(|f| f.total_records).collect();
        assert_eq!(rows, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_list_flights_empty_registry() {
        let service = service(vec![]);
        assert!(list(&service, "").await.is_empty());
    }

    #[tokio::test]
    async fn test_list_flights_prefix_criteria() {
        let service = service(vec![
            dataset("trips_2023", 1),
            dataset("zones", 1),
            dataset("trips_2024", 1),
        ]);
        let flights = list(&service, "trips_").await;
        assert_eq!(flights.len(), 2);
        assert!(list(&service, "nothing").await.is_empty());
    }

    #[tokio::test]
    async fn test_list_flights_rejects_binary_criteria() {
        let service = service(vec![dataset("t", 1)]);
        let criteria = Criteria {
            expression: vec![0xff, 0xfe].into(),
        };
        let status = service
            .list_flights(Request::new(criteria))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_get_flight_info_and_schema() {
        let service = service(vec![dataset("t", 4)]);

        let info = service
            .get_flight_info(Request::new(FlightDescriptor::new_path(vec!["t".to_string()])))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.total_records, 4);

        let info = service
            .get_flight_info(Request::new(FlightDescriptor::new_cmd("t")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.total_records, 4);

        let schema = service
            .get_schema(Request::new(FlightDescriptor::new_path(vec!["t".to_string()])))
            .await
            .unwrap()
            .into_inner();
        assert!(!schema.schema.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let service = service(vec![dataset("t", 1)]);
        let status = service
            .get_flight_info(Request::new(FlightDescriptor::new_path(vec![
                "missing".to_string()
            ])))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_descriptor_path_must_have_one_segment() {
        let service = service(vec![dataset("a", 1)]);
        let status = service
            .get_flight_info(Request::new(FlightDescriptor::new_path(vec![
                "a".to_string(),
                "b".to_string(),
            ])))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let info = service
            .get_flight_info(Request::new(FlightDescriptor::new_path(vec!["a".to_string()])))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.total_records, 1);
    }

    #[tokio::test]
    async fn test_data_transfer_is_unimplemented() {
        let service = service(vec![dataset("t", 1)]);
        let status = service
            .do_get(Request::new(Ticket::new("t")))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_start_reports_bound_port() {
        let config = ServerConfig::new(FlightLocation::parse("grpc://127.0.0.1:0").unwrap());
        let handle = ListingServer::with_sample_dataset(config)
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.location().port(), handle.local_addr().port());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let config = ServerConfig::new(FlightLocation::parse("grpc://127.0.0.1:0").unwrap());
        let first = ListingServer::new(config, DatasetRegistry::empty())
            .start()
            .await
            .unwrap();

        let taken = ServerConfig::new(first.location().clone());
        let err = ListingServer::new(taken, DatasetRegistry::empty())
            .start()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ListingError::BindError { .. }));
    }
}
