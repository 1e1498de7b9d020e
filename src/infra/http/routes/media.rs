use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde_json::json;
use tracing::warn;

use crate::application::error::AppError;
use crate::application::media::{MediaUpload, MediaUploadService};
use crate::infra::http::UserId;

const FILE_FIELD: &str = "file";
const DEFAULT_FILE_NAME: &str = "upload.bin";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct MediaState {
    pub uploads: Arc<MediaUploadService>,
    /// Request body limit for uploads, in bytes.
    pub max_upload_bytes: usize,
}

pub(in crate::infra::http) fn router(state: MediaState) -> Router {
    let limit = state.max_upload_bytes;
    Router::new()
        .route("/api/media/upload", post(upload_media))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

async fn upload_media(
    State(state): State<MediaState>,
    user: UserId,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let mut multipart = multipart.map_err(|err| AppError::validation(err.body_text()))?;
    let upload = read_file_field(&mut multipart).await?;
    let record = state.uploads.upload(user.as_str(), upload).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "mediaId": record.id,
            "message": "Media uploaded successfully",
            "url": record.url,
        })),
    ))
}

/// Read the single `file` field; other fields are ignored.
async fn read_file_field(multipart: &mut Multipart) -> Result<MediaUpload, AppError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(AppError::validation("No file uploaded")),
            Err(err) => return Err(multipart_error(err)),
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let original_name = field
            .file_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME)
            .to_string();
        let mime_type = field
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;

        return Ok(MediaUpload {
            original_name,
            mime_type,
            bytes: bytes.to_vec(),
        });
    }
}

fn multipart_error(err: MultipartError) -> AppError {
    warn!(status = err.status().as_u16(), error = %err, "Failed to read multipart payload");
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        AppError::validation(err.body_text())
    }
}
