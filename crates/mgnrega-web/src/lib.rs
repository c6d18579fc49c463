//! Axum JSON API consumed by the dashboard: refresh trigger, filtered reads,
//! district listing and summary figures.

use std::fmt::Display;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mgnrega_core::RecordFilter;
use mgnrega_sync::{connect_store, live_source, IngestConfig, IngestPipeline};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "mgnrega-web";

pub const BANNER: &str = "MGNREGA API Server Running";

#[derive(Clone)]
pub struct AppState {
    pipeline: IngestPipeline,
}

impl AppState {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct FetchResponse {
    message: String,
    fetched: usize,
    written: usize,
    run_id: String,
}

/// One entry of the district listing, shaped as the dashboard reads it.
#[derive(Debug, Serialize)]
struct DistrictRow {
    district_name: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(health_handler))
        .route("/api/mgnrega", get(records_handler))
        .route("/api/mgnrega/fetch", get(fetch_handler).post(fetch_handler))
        .route("/api/mgnrega/districts", get(districts_handler))
        .route("/api/mgnrega/summary", get(summary_handler))
        .layer(middleware::map_response(allow_any_origin))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let store = connect_store(&config).await?;
    match store.ping().await {
        Ok(()) => info!(backend = store.backend().as_str(), "storage reachable"),
        Err(err) => warn!(error = %err, "storage ping failed"),
    }
    let source = live_source(&config)?;
    let state = AppState::new(IngestPipeline::new(source, store));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "api server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

async fn root_handler() -> &'static str {
    BANNER
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().ping().await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "unavailable"})),
            )
                .into_response()
        }
    }
}

async fn fetch_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(FetchResponse {
            message: summary.message(),
            fetched: summary.fetched,
            written: summary.written,
            run_id: summary.run_id.to_string(),
        })
        .into_response(),
        Err(err) => server_error("Database insert failed", err),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RecordFilter>,
) -> Response {
    match state.pipeline.store().query(&filter).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error("Database query failed", err),
    }
}

async fn districts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().distinct_districts().await {
        Ok(districts) => Json(
            districts
                .into_iter()
                .map(|district_name| DistrictRow { district_name })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error("Error fetching districts", err),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RecordFilter>,
) -> Response {
    match state.pipeline.store().summary(&filter).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error("Error computing summary", err),
    }
}

/// Logs the cause and answers with a fixed message; internals never reach the client.
fn server_error(public_message: &'static str, err: impl Display) -> Response {
    error!(error = %err, "{public_message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": public_message })),
    )
        .into_response()
}
