//! skala REST surface.
//!
//! Two endpoints under `/api/v1` sharing the autoscale pipeline with the
//! ticker: read-only metric collection, and evaluation with an optional
//! dry run. Every response is JSON with an explicit charset and nosniff
//! header; errors use a `{"message", "code"}` envelope.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{OriginalUri, Query, State},
    http::{header, Method, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use skala_core::RunType;
use skala_engine::AutoscalePipeline;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<AutoscalePipeline>,
}

/// Error envelope returned for every non-2xx response.
#[derive(Debug, Serialize)]
struct ApiError {
    message: String,
    code: u16,
}

pub fn router(pipeline: Arc<AutoscalePipeline>) -> Router {
    Router::new()
        .route("/api/v1/metrics", get(get_metrics).fallback(method_not_allowed))
        .route("/api/v1/evaluation", post(post_evaluation).fallback(method_not_allowed))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { pipeline })
}

/// Bind and serve until `shutdown` flips, then drain gracefully.
pub async fn serve(
    pipeline: Arc<AutoscalePipeline>,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind REST listener on {addr}"))?;
    info!(addr = %addr, "REST API listening");
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("REST server failed")
}

async fn get_metrics(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    counter!("skala_api_requests_total", 1);
    let run_type = match run_type_for(&params) {
        Ok(run_type) => run_type,
        Err(resp) => return resp,
    };
    match state.pipeline.metrics(run_type).await {
        Ok(metrics) => json_response(StatusCode::OK, &metrics),
        Err(err) => internal_error(err),
    }
}

async fn post_evaluation(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    counter!("skala_api_requests_total", 1);
    let run_type = match run_type_for(&params) {
        Ok(run_type) => run_type,
        Err(resp) => return resp,
    };
    let dry_run = run_type == RunType::ApiDryRun;
    match state.pipeline.evaluate(run_type, dry_run).await {
        Ok(evaluation) => json_response(StatusCode::OK, &evaluation),
        Err(err) => internal_error(err),
    }
}

async fn method_not_allowed(method: Method, OriginalUri(uri): OriginalUri) -> Response {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Method '{}' not allowed on resource '{}'", method, uri.path()),
    )
}

async fn not_found(OriginalUri(uri): OriginalUri) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("Resource '{}' not found", uri.path()))
}

/// `dry_run` defaults to false and must be a valid boolean when present.
fn run_type_for(params: &HashMap<String, String>) -> Result<RunType, Response> {
    match params.get("dry_run") {
        None => Ok(RunType::Api),
        Some(raw) => match raw.parse::<bool>() {
            Ok(true) => Ok(RunType::ApiDryRun),
            Ok(false) => Ok(RunType::Api),
            Err(_) => Err(error_response(
                StatusCode::BAD_REQUEST,
                format!(
                    "Invalid format for 'dry_run' query parameter; '{raw}' is not a valid boolean value"
                ),
            )),
        },
    }
}

fn internal_error(err: anyhow::Error) -> Response {
    warn!(error = ?err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

fn error_response(status: StatusCode, message: String) -> Response {
    debug!(code = status.as_u16(), message = %message, "error response");
    json_response(status, &ApiError { message, code: status.as_u16() })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to serialize response body");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_default();
        }
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from(bytes))
        .unwrap_or_default()
}
