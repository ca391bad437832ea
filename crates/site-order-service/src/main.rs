use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use site_order_api::{
    order_error, CreateRecordRequest, IntegrityReport, ReindexRequest, ReorderOutcome,
    SiteOrderApi, SwapRequest, API_CONTRACT_VERSION,
};
use site_order_core::{Collection, OrderError, OrderReport, OrderedRecord, RecordId};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: SiteOrderApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct SuccessBody {
    success: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct DeletedRecord {
    collection: Collection,
    deleted: RecordId,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    service_contract_version: &'static str,
    status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "site-order-service")]
#[command(about = "Local HTTP service for site display-order maintenance")]
struct Args {
    #[arg(long, default_value = "./site_order.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.error })).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, error: message.into() }
    }

    fn invalid(err: OrderError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.message())
    }

    /// Map an api failure: invalid requests keep their message, anything else is
    /// logged in full and replaced by `public_message`.
    fn from_api(err: &anyhow::Error, collection: Collection, public_message: String) -> Self {
        match order_error(err) {
            Some(OrderError::InvalidRequest(message)) => {
                Self::new(StatusCode::BAD_REQUEST, message.clone())
            }
            _ => {
                tracing::error!(collection = collection.as_str(), "{public_message}: {err:#}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, public_message)
            }
        }
    }

    fn reorder(err: &anyhow::Error, collection: Collection) -> Self {
        Self::from_api(err, collection, format!("Failed to reorder {}", collection.label()))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Decode a request body as JSON. Bodies that are empty or not JSON decode to
/// `null`, which every request shape then rejects as missing its fields.
fn parse_body(collection: Collection, bytes: &[u8]) -> Value {
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(
                collection = collection.as_str(),
                bytes = bytes.len(),
                "Request body is not JSON: {err}"
            );
            Value::Null
        }
    }
}

fn parse_collection(raw: &str) -> Result<Collection, ServiceError> {
    Collection::parse(raw).ok_or_else(|| {
        ServiceError::new(StatusCode::NOT_FOUND, format!("unknown collection: {raw}"))
    })
}

/// Run a blocking store call off the async runtime.
async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| anyhow!("blocking task failed: {err}"))?
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/collections/:collection", get(list_records).post(create_record))
        .route("/v1/collections/:collection/reorder", post(reorder))
        .route("/v1/collections/:collection/swap", post(swap))
        .route("/v1/collections/:collection/compact", post(compact))
        .route("/v1/collections/:collection/report", get(order_report))
        .route("/v1/collections/:collection/records/:id", delete(delete_record))
        .route("/v1/integrity", get(integrity_check))
        .with_state(state)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => {
            tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let api = SiteOrderApi::new(args.db.clone());
    let migrate_api = api.clone();
    let migrated = run_blocking(move || migrate_api.migrate(false)).await?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = ?migrated.after_version,
        "Database ready"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("Listening on {}", args.bind);
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { service_contract_version: SERVICE_CONTRACT_VERSION, status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn list_records(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<OrderedRecord>>>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let api = state.api;
    let records = run_blocking(move || api.list_records(collection)).await.map_err(|err| {
        ServiceError::from_api(&err, collection, format!("Failed to list {}", collection.label()))
    })?;
    Ok(Json(envelope(records)))
}

async fn create_record(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<OrderedRecord>>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let request = serde_json::from_slice::<CreateRecordRequest>(&body)
        .map_err(|_| ServiceError::new(StatusCode::BAD_REQUEST, "title is required"))?;
    let api = state.api;
    let record = run_blocking(move || api.create_record(collection, &request)).await.map_err(
        |err| {
            ServiceError::from_api(
                &err,
                collection,
                format!("Failed to create {} record", collection.label()),
            )
        },
    )?;
    Ok(Json(envelope(record)))
}

async fn reorder(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
    body: Bytes,
) -> Result<Json<SuccessBody>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let request = ReindexRequest::from_json(&parse_body(collection, &body)).map_err(ServiceError::invalid)?;
    let api = state.api;
    let outcome = run_blocking(move || api.reindex(collection, &request))
        .await
        .map_err(|err| ServiceError::reorder(&err, collection))?;
    tracing::info!(
        collection = collection.as_str(),
        changed = outcome.changed.len(),
        "Reindexed collection"
    );
    Ok(Json(SuccessBody { success: true }))
}

async fn swap(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
    body: Bytes,
) -> Result<Json<SuccessBody>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let request = SwapRequest::from_json(&parse_body(collection, &body)).map_err(ServiceError::invalid)?;
    let api = state.api;
    let outcome = run_blocking(move || api.swap(collection, request))
        .await
        .map_err(|err| ServiceError::reorder(&err, collection))?;
    tracing::info!(
        collection = collection.as_str(),
        id1 = request.id1.get(),
        id2 = request.id2.get(),
        changed = outcome.changed.len(),
        "Swapped ranks"
    );
    Ok(Json(SuccessBody { success: true }))
}

async fn delete_record(
    State(state): State<ServiceState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<DeletedRecord>>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let id = id.parse::<RecordId>().map_err(ServiceError::invalid)?;
    let api = state.api;
    let deleted = run_blocking(move || api.delete_record(collection, id)).await.map_err(|err| {
        ServiceError::from_api(
            &err,
            collection,
            format!("Failed to delete {} record", collection.label()),
        )
    })?;
    if !deleted {
        return Err(ServiceError::new(
            StatusCode::NOT_FOUND,
            format!("{} record {id} not found", collection.label()),
        ));
    }
    tracing::info!(collection = collection.as_str(), id = id.get(), "Deleted record");
    Ok(Json(envelope(DeletedRecord { collection, deleted: id })))
}

async fn compact(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
) -> Result<Json<ServiceEnvelope<ReorderOutcome>>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let api = state.api;
    let outcome = run_blocking(move || api.compact(collection))
        .await
        .map_err(|err| ServiceError::reorder(&err, collection))?;
    tracing::info!(
        collection = collection.as_str(),
        changed = outcome.changed.len(),
        "Compacted collection"
    );
    Ok(Json(envelope(outcome)))
}

async fn order_report(
    State(state): State<ServiceState>,
    Path(collection): Path<String>,
) -> Result<Json<ServiceEnvelope<OrderReport>>, ServiceError> {
    let collection = parse_collection(&collection)?;
    let api = state.api;
    let report = run_blocking(move || api.order_report(collection)).await.map_err(|err| {
        ServiceError::from_api(&err, collection, format!("Failed to check {}", collection.label()))
    })?;
    Ok(Json(envelope(report)))
}

async fn integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let api = state.api;
    let report = run_blocking(move || api.integrity_check()).await.map_err(|err| {
        tracing::error!("Integrity check failed: {err:#}");
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to check integrity")
    })?;
    Ok(Json(envelope(report)))
}
