//! HTTP API for the docpipe service.
//!
//! This module provides the REST API endpoints for:
//! - Health monitoring
//! - Project creation, uploads and the processing trigger
//! - Progress reporting
//! - Presigned object reads

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    routing::{delete, get, post},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::pipeline::Pipeline;

pub mod objects;
pub mod projects;
use objects::read_object_handler;
use projects::{
    create_project_handler, delete_document_handler, process_project_handler,
    project_progress_handler, upload_document_handler,
};

/// Application state
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub start_time: Instant,
}

/// Build the API router
pub fn router(pipeline: Arc<Pipeline>, max_upload_bytes: usize) -> Router {
    let state = Arc::new(AppState {
        pipeline,
        start_time: Instant::now(),
    });

    let api_routes = Router::new()
        .route("/projects", post(create_project_handler))
        .route("/projects/{id}/progress", get(project_progress_handler))
        .route("/projects/{id}/process", post(process_project_handler))
        // Raw document bytes, so uploads get a larger body limit
        .route(
            "/projects/{id}/documents",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route(
            "/projects/{id}/documents/{document_id}",
            delete(delete_document_handler),
        );

    Router::new()
        .route("/health", get(health_handler))
        .route("/objects/{*key}", get(read_object_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let inference_available = state.pipeline.inference().health_check().await;

    let status = if inference_available {
        "healthy".to_string()
    } else {
        "degraded: inference unavailable".to_string()
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        inference_available,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    inference_available: bool,
}
