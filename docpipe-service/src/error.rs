use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Project not found: {project_id}")]
    ProjectNotFound { project_id: String },

    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("{0}")]
    Inference(#[from] InferenceError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Document processing failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Inference collaborator errors
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Connection failed to inference service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Inference request to {url} timed out")]
    Timeout { url: String },

    #[error("Inference request failed (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response from inference service: {message}")]
    InvalidResponse { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Entity lease requested outside an exclusive unit of work")]
    LeaseOutsideUnitOfWork,
}

/// Document processing errors
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Document {document_id} has no stored source file")]
    MissingSource { document_id: String },

    #[error("Parser call failed: {message}")]
    Parser { message: String },

    #[error("Invalid chunk descriptor at index {index}: {message}")]
    InvalidDescriptor { index: usize, message: String },

    #[error("Image upload failed for {path}: {message}")]
    ImageUpload { path: String, message: String },

    #[error("Counter update rejected for document {document_id}: {message}")]
    CounterConflict {
        document_id: String,
        message: String,
    },

    #[error("Unsupported file format: {format}")]
    UnsupportedFormat { format: String },

    #[error("IO error")]
    Io(#[source] std::io::Error),
}

/// Object storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("Storage IO failed for {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Presigned URL rejected: {reason}")]
    Signature { reason: String },
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    /// Whether the task queue should schedule another attempt after this error.
    ///
    /// Network and storage failures are transient. Bad parser output, a missing
    /// source blob or a vanished entity will not get better on a retry. A failed
    /// image upload already aborted its document, so it is final as well.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::ProjectNotFound { .. }
            | ServiceError::DocumentNotFound { .. }
            | ServiceError::InvalidRequest { .. }
            | ServiceError::Config { .. } => false,
            ServiceError::Processing(ProcessingError::MissingSource { .. })
            | ServiceError::Processing(ProcessingError::InvalidDescriptor { .. })
            | ServiceError::Processing(ProcessingError::UnsupportedFormat { .. })
            | ServiceError::Processing(ProcessingError::ImageUpload { .. }) => false,
            ServiceError::Storage(StorageError::InvalidKey { .. })
            | ServiceError::Storage(StorageError::NotFound { .. }) => false,
            ServiceError::Inference(InferenceError::Status { status, .. }) => {
                // 4xx other than throttling/timeouts means the request itself is wrong
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            _ => true,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::ProjectNotFound { .. }
            | ServiceError::DocumentNotFound { .. }
            | ServiceError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest { .. }
            | ServiceError::Storage(StorageError::InvalidKey { .. }) => StatusCode::BAD_REQUEST,
            ServiceError::Storage(StorageError::Signature { .. }) => StatusCode::FORBIDDEN,
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ServiceError::Inference(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::ProjectNotFound { .. } => "project_not_found",
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::Inference(InferenceError::Connection { .. }) => "inference_connection",
            ServiceError::Inference(InferenceError::Timeout { .. }) => "inference_timeout",
            ServiceError::Inference(InferenceError::Status { .. }) => "inference_status",
            ServiceError::Inference(InferenceError::InvalidResponse { .. }) => {
                "inference_invalid_response"
            }
            ServiceError::Database(_) => "database_error",
            ServiceError::Processing(ProcessingError::MissingSource { .. }) => "missing_source",
            ServiceError::Processing(ProcessingError::Parser { .. }) => "parser_error",
            ServiceError::Processing(ProcessingError::InvalidDescriptor { .. }) => {
                "invalid_descriptor"
            }
            ServiceError::Processing(ProcessingError::ImageUpload { .. }) => "image_upload_failed",
            ServiceError::Processing(ProcessingError::CounterConflict { .. }) => {
                "counter_conflict"
            }
            ServiceError::Processing(ProcessingError::UnsupportedFormat { .. }) => {
                "unsupported_format"
            }
            ServiceError::Processing(ProcessingError::Io(_)) => "io_error",
            ServiceError::Storage(StorageError::NotFound { .. }) => "object_not_found",
            ServiceError::Storage(StorageError::InvalidKey { .. }) => "invalid_object_key",
            ServiceError::Storage(StorageError::Io { .. }) => "storage_io",
            ServiceError::Storage(StorageError::Signature { .. }) => "invalid_signature",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error together with its `source()` chain on one line.
pub fn format_error_chain_ref(error: &ServiceError) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
