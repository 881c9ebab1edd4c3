//! Presigned object delivery.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;

use super::AppState;
use crate::error::ServiceError;

#[derive(Debug, Deserialize)]
pub struct PresignParams {
    pub expires: u64,
    pub sig: String,
}

/// Serve an object behind a presigned link
pub async fn read_object_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<PresignParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let store = state.pipeline.store();
    store.verify_presigned(&key, params.expires, &params.sig)?;
    let bytes = store.read(&key).await?;

    Ok(([(header::CONTENT_TYPE, content_type(&key))], bytes))
}

fn content_type(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt" | "md") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::content_type;

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type("images/p/d/c/x_fig.PNG"), "image/png");
        assert_eq!(content_type("uploads/p/x_report.pdf"), "application/pdf");
        assert_eq!(content_type("uploads/p/x_blob"), "application/octet-stream");
    }
}
