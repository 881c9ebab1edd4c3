//! Project and document endpoints.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;

use super::AppState;
use crate::db::{Document, Project};
use crate::error::ServiceError;
use crate::pipeline::{ProcessSummary, ProjectProgress};

/// Create project request
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

/// Query parameters for an upload
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: String,
}

pub async fn create_project_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ServiceError> {
    let project = state.pipeline.create_project(&request.name).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// Upload a document as the raw request body
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<Document>), ServiceError> {
    if body.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "Upload body is empty".to_string(),
        });
    }

    let document = state
        .pipeline
        .register_document(&project_id, &params.filename, body)
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Path((project_id, document_id)): Path<(String, String)>,
) -> Result<StatusCode, ServiceError> {
    state
        .pipeline
        .delete_document(&project_id, &document_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start processing every document of the project
pub async fn process_project_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<(StatusCode, Json<ProcessSummary>), ServiceError> {
    let summary = state.pipeline.process_project(&project_id).await?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

pub async fn project_progress_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectProgress>, ServiceError> {
    let progress = state.pipeline.project_progress(&project_id).await?;
    Ok(Json(progress))
}
