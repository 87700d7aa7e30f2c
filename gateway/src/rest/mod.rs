//! Operator-facing query API.

pub mod error;
pub mod middleware;
pub mod ratelimit;

use crate::db::Store;
use crate::errors::Result;
use crate::metrics::gather_metrics;
use crate::model::{
    ConfigurePeripheralRequest, MessageResponse, PeripheralsResponse, ReadingsRequest,
    ReadingsResponse, VersionResponse,
};
use crate::validate::{
    validate_configure_request, validate_readings_request, MAX_READINGS_PER_QUERY,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::header::CONTENT_TYPE,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use error::ApiError;
use middleware::{handle_panic, log_requests, rate_limit, require_api_key, ApiKey, LogConfig};
use ratelimit::RateLimiter;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

pub const API_PREFIX: &str = "/api/v1";
pub const API_VERSION: &str = "1.0.0";

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone)]
pub struct AppState {
    pub store: Store,
}

/// What the gateway chain needs besides the handlers' state
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: ApiKey,
    pub limiter: RateLimiter,
    pub log: LogConfig,
}

/// Builds the API with the full request gateway in front of every route,
/// including unknown paths.
pub fn create_router(state: AppState, gateway: GatewayConfig) -> Router {
    create_router_with(state, gateway, Router::new())
}

/// Same as [`create_router`], with `extra` routes mounted under
/// [`API_PREFIX`] behind the same gateway chain.
pub fn create_router_with(state: AppState, gateway: GatewayConfig, extra: Router<AppState>) -> Router {
    let api = Router::new()
        .route("/version", get(get_version))
        .route("/peripherals", get(list_peripherals).post(configure_peripheral))
        .route("/readings", post(get_readings))
        .route("/metrics", get(get_metrics))
        .merge(extra);

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn_with_state(gateway.limiter, rate_limit))
        .layer(from_fn_with_state(gateway.api_key, require_api_key))
        .layer(from_fn_with_state(gateway.log, log_requests))
}

/// Serves `app` until `shutdown` fires, then lets in-flight requests finish.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: API_VERSION,
    })
}

async fn list_peripherals(State(state): State<AppState>) -> ApiResult<Json<PeripheralsResponse>> {
    let peripherals = state.store.get_all_peripherals().await?;
    Ok(Json(PeripheralsResponse { peripherals }))
}

async fn configure_peripheral(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ConfigurePeripheralRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(request) = payload?;
    validate_configure_request(&request)?;

    let existing = state
        .store
        .get_peripheral_by_serial(&request.serial_number)
        .await?
        .ok_or_else(|| ApiError::NotFound("Peripheral not found".to_string()))?;

    let peripheral_type = request.peripheral_type.unwrap_or(existing.peripheral_type);
    let updated = state
        .store
        .update_peripheral(&request.serial_number, request.name.trim(), peripheral_type)
        .await?;
    if !updated {
        return Err(ApiError::NotFound("Peripheral not found".to_string()));
    }

    info!(
        serial_number = %request.serial_number,
        name = %request.name.trim(),
        peripheral_type = %peripheral_type,
        "Peripheral configured"
    );

    Ok(Json(MessageResponse {
        message: "Peripheral name set successfully".to_string(),
    }))
}

async fn get_readings(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ReadingsRequest>, JsonRejection>,
) -> ApiResult<Json<ReadingsResponse>> {
    let Json(request) = payload?;
    validate_readings_request(&request)?;

    let limit = request.num_readings.min(MAX_READINGS_PER_QUERY);
    let readings = state
        .store
        .get_last_readings(&request.serial_number, limit)
        .await?;

    Ok(Json(ReadingsResponse { readings }))
}

async fn get_metrics() -> ApiResult<impl IntoResponse> {
    let body = gather_metrics()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}
