//! # Track Queue HTTP Service
//!
//! HTTP surface of the track ingestion queue.
//!
//! This service provides:
//! - A producer endpoint that enqueues point batches
//! - Health and stats endpoints
//! - Admin endpoints to force processing, inspect and replay the dead-letter
//!   store, clear queues and purge old entries

pub mod config;
pub mod errors;
pub mod responses;

pub use config::{
    LoggingConfig, PointBackend, QueueBackend, ServerConfig, ServiceConfig, StorageConfig,
};
pub use errors::{ApiError, ServiceError};
pub use responses::*;

use axum::{
    extract::{FromRequest, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use track_queue_core::{
    CleanupReport, CycleReport, DlqInspection, HealthStatus, IngestService, QueueStats,
    QueueType, ReplayReport, ShutdownToken, Timestamp, Ulid,
};
use tracing::{error, info, instrument, warn};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: Arc<ServiceConfig>,

    /// Queue, workers and admin operations
    pub service: IngestService,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ServiceConfig, service: IngestService) -> Self {
        Self {
            config: Arc::new(config),
            service,
        }
    }
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let producer_routes =
        Router::new().route("/queues/{queue_type}/points", post(handle_enqueue));

    let health_routes = Router::new()
        .route("/health", get(handle_health_check))
        .route("/stats", get(handle_all_stats))
        .route("/stats/{queue_type}", get(handle_queue_stats));

    let admin_routes = Router::new()
        .route("/admin/dlq/{queue_type}", get(handle_inspect_dlq))
        .route("/admin/dlq/{queue_type}/replay", post(handle_replay_dlq))
        .route("/admin/queues/{queue_type}/process", post(handle_force_process))
        .route("/admin/queues/{queue_type}/clear", post(handle_clear_queue))
        .route("/admin/cleanup", post(handle_cleanup));

    Router::new()
        .merge(producer_routes)
        .merge(health_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(request_logging_middleware))
                .into_inner(),
        )
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` is cancelled
pub async fn start_server(
    config: ServiceConfig,
    service: IngestService,
    shutdown: ShutdownToken,
) -> Result<(), ServiceError> {
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    info!(address = %address, "Starting HTTP server");

    serve(listener, AppState::new(config, service), shutdown).await
}

/// Serve on an already bound listener until `shutdown` is cancelled
///
/// In-flight requests are allowed to complete; new connections are refused
/// as soon as shutdown begins.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: ShutdownToken,
) -> Result<(), ServiceError> {
    let app = create_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?;

    info!("HTTP server shutdown complete");
    Ok(())
}

fn parse_queue_type(value: &str) -> Result<QueueType, ApiError> {
    value.parse().map_err(|_| ApiError::UnknownQueueType {
        value: value.to_string(),
    })
}

/// JSON request body whose rejections answer with the `ApiError` body
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct JsonBody<T>(T);

// ============================================================================
// Producer Handlers
// ============================================================================

/// Accept a point batch for asynchronous persistence
///
/// Responds `202 Accepted` as soon as the queue store holds the batch.
#[instrument(skip(state, request))]
async fn handle_enqueue(
    State(state): State<AppState>,
    Path(queue_type): Path<String>,
    JsonBody(request): JsonBody<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let queue_type = parse_queue_type(&queue_type)?;
    let points = request.points.len();

    let item_id = state
        .service
        .enqueue(queue_type, request.points, request.priority)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            item_id,
            queue_type,
            points,
        }),
    ))
}

// ============================================================================
// Health and Stats Handlers
// ============================================================================

/// Health verdict across all queues
///
/// Healthy and degraded answer 200 so load balancers keep routing; critical
/// answers 503.
#[instrument(skip(state))]
async fn handle_health_check(State(state): State<AppState>) -> Result<Response, ApiError> {
    let report = state.service.health().await?;
    let status = if report.status == HealthStatus::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    if report.status != HealthStatus::Healthy {
        warn!(status = %report.status, "Health check is not healthy");
    }

    let response = HealthResponse {
        report,
        timestamp: Timestamp::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    Ok((status, Json(response)).into_response())
}

async fn handle_all_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let queues = state.service.all_stats().await?;
    Ok(Json(StatsResponse {
        queues,
        timestamp: Timestamp::now(),
    }))
}

async fn handle_queue_stats(
    State(state): State<AppState>,
    Path(queue_type): Path<String>,
) -> Result<Json<QueueStats>, ApiError> {
    let queue_type = parse_queue_type(&queue_type)?;
    Ok(Json(state.service.stats(queue_type).await?))
}

// ============================================================================
// Admin Handlers
// ============================================================================

#[instrument(skip(state))]
async fn handle_inspect_dlq(
    State(state): State<AppState>,
    Path(queue_type): Path<String>,
    Query(params): Query<InspectParams>,
) -> Result<Json<DlqInspection>, ApiError> {
    let queue_type = parse_queue_type(&queue_type)?;
    Ok(Json(
        state.service.inspect_dlq(queue_type, params.limit).await?,
    ))
}

#[instrument(skip(state))]
async fn handle_replay_dlq(
    State(state): State<AppState>,
    Path(queue_type): Path<String>,
    JsonBody(request): JsonBody<ReplayRequest>,
) -> Result<Json<ReplayReport>, ApiError> {
    let queue_type = parse_queue_type(&queue_type)?;
    let report = state
        .service
        .replay_dlq(queue_type, request.limit, request.dry_run)
        .await?;
    Ok(Json(report))
}

#[instrument(skip(state))]
async fn handle_force_process(
    State(state): State<AppState>,
    Path(queue_type): Path<String>,
    JsonBody(request): JsonBody<ProcessRequest>,
) -> Result<Json<CycleReport>, ApiError> {
    let queue_type = parse_queue_type(&queue_type)?;
    let batch_size = request
        .batch_size
        .unwrap_or(state.config.ingest.worker.batch_size);

    Ok(Json(
        state.service.force_process(queue_type, batch_size).await?,
    ))
}

#[instrument(skip(state))]
async fn handle_clear_queue(
    State(state): State<AppState>,
    Path(queue_type): Path<String>,
    JsonBody(request): JsonBody<ClearRequest>,
) -> Result<Json<ClearResponse>, ApiError> {
    let queue_type = parse_queue_type(&queue_type)?;
    let removed = state
        .service
        .clear_queue(queue_type, request.include_dlq, request.confirm)
        .await?;

    Ok(Json(ClearResponse {
        queue_type,
        removed,
    }))
}

#[instrument(skip(state))]
async fn handle_cleanup(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CleanupRequest>,
) -> Result<Json<CleanupReport>, ApiError> {
    let report = state
        .service
        .cleanup(Duration::from_secs(request.max_age_seconds), request.dry_run)
        .await?;
    Ok(Json(report))
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware
///
/// Logs the outcome of every request with a correlation ID, taken
/// from the `x-correlation-id` header or generated, and echoes the ID back
/// in the response headers.
#[instrument(skip(request, next), fields(
    method = %request.method(),
    uri = %request.uri(),
    correlation_id
))]
async fn request_logging_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let start = std::time::Instant::now();

    let correlation_id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Ulid::new().to_string());

    tracing::Span::current().record("correlation_id", correlation_id.as_str());
    request.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(request).await;
    let duration = start.elapsed();

    if let Ok(header_value) = correlation_id.parse() {
        response
            .headers_mut()
            .insert("x-correlation-id", header_value);
    }

    // method, uri and correlation_id are already on the span
    let status = response.status().as_u16();
    let duration_ms = duration.as_millis() as u64;
    match status {
        500..=u16::MAX => error!(status, duration_ms, "Request failed"),
        400..=499 => warn!(status, duration_ms, "Request rejected"),
        _ => info!(status, duration_ms, "Request completed"),
    }

    response
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
