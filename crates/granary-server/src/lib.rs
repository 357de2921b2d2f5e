// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! granary-server
#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use granary_core::JobId;
use granary_store::Store;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state of the browser view: the store plus the names of the
/// builders registered in the owning runtime (so empty builders still show).
#[derive(Clone)]
pub struct AppState {
    /// Store handle used for all queries.
    pub store: Arc<Store>,
    /// Registered builder names.
    pub builders: Vec<String>,
}

impl AppState {
    /// State over a store with a known set of registered builders.
    pub fn new(store: Arc<Store>, builders: Vec<String>) -> AppState {
        AppState { store, builders }
    }
}

/// JSON error envelope for failed queries.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<granary_store::StoreError> for ApiError {
    fn from(e: granary_store::StoreError) -> ApiError {
        ApiError::internal(e.to_string())
    }
}

/// Build the router with all browser routes.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/builders", get(get_builders))
        .route("/jobs/{builder}", get(get_jobs))
        .route("/blobs/{job_id}", get(get_blobs))
        .route("/status/", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_builders(State(state): State<AppState>) -> Result<Response, ApiError> {
    let summaries = state.store.builder_summaries(&state.builders)?;
    Ok(Json(summaries).into_response())
}

async fn get_jobs(
    State(state): State<AppState>,
    AxPath(builder): AxPath<String>,
) -> Result<Response, ApiError> {
    let jobs = state.store.job_summaries(&builder)?;
    Ok(Json(jobs).into_response())
}

async fn get_blobs(
    State(state): State<AppState>,
    AxPath(job_id): AxPath<i64>,
) -> Result<Response, ApiError> {
    let blobs = state.store.blob_summaries(JobId(job_id))?;
    Ok(Json(blobs).into_response())
}

async fn get_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let status = state.store.running_status()?;
    Ok(Json(status).into_response())
}

/// Serve the browser view until the task is aborted.
///
/// # Errors
///
/// Fails when the listener cannot bind.
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "granary.server", %addr, "serving browser view");
    axum::serve(listener, app).await
}
