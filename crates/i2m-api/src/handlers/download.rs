//! Generated model downloads.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::info;

use i2m_models::{format_bytes, JobId};

use crate::auth::{authorize_job, ApiCaller, SessionHeader};
use crate::error::{ApiError, ApiResult};
use crate::security::{is_valid_model_filename, parse_job_id};
use crate::state::AppState;

/// Reserved filename that lists a job's files instead of serving one.
const LIST_ALL: &str = "all";

#[derive(Debug, Serialize)]
pub struct DownloadableFile {
    pub filename: String,
    pub size_bytes: u64,
    pub size: String,
    pub download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct DownloadListResponse {
    pub job_id: String,
    pub files: Vec<DownloadableFile>,
    pub total: usize,
}

/// MIME type for a model file extension.
pub fn model_content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "glb" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "obj" => "model/obj",
        "usdz" => "model/vnd.usdz+zip",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// GET /api/v1/download/:job_id/:filename
///
/// `all` as the filename returns the list of downloadable files.
pub async fn download_file(
    State(state): State<AppState>,
    Path((job_id, filename)): Path<(String, String)>,
    caller: ApiCaller,
    session: SessionHeader,
) -> ApiResult<Response> {
    let job_id = parse_job_id(&job_id)?;
    authorize_job(&state, &caller, &session, &job_id).await?;

    if filename == LIST_ALL {
        return Ok(list_files(&state, &job_id).await?.into_response());
    }

    if !is_valid_model_filename(&filename) {
        return Err(ApiError::bad_request("Invalid filename"));
    }

    let (file, size) = state.storage.open_model(&job_id, &filename).await?;
    info!(job_id = %job_id, filename = %filename, size_bytes = size, "Serving model download");

    let disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        filename,
        urlencoding::encode(&filename)
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, model_content_type(&filename))
        .header(header::CONTENT_LENGTH, size.to_string())
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CACHE_CONTROL, "private, max-age=3600")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

async fn list_files(state: &AppState, job_id: &JobId) -> ApiResult<Json<DownloadListResponse>> {
    let stored = state.storage.list_models(job_id).await?;

    let files: Vec<DownloadableFile> = stored
        .into_iter()
        .map(|f| DownloadableFile {
            download_url: format!("/api/v1/download/{}/{}", job_id, f.name),
            size: format_bytes(f.size_bytes),
            filename: f.name,
            size_bytes: f.size_bytes,
            modified_at: f.modified_at,
        })
        .collect();

    Ok(Json(DownloadListResponse {
        job_id: job_id.to_string(),
        total: files.len(),
        files,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_content_type() {
        assert_eq!(model_content_type("cat.glb"), "model/gltf-binary");
        assert_eq!(model_content_type("CAT.GLB"), "model/gltf-binary");
        assert_eq!(model_content_type("scene.gltf"), "model/gltf+json");
        assert_eq!(model_content_type("noext"), "application/octet-stream");
    }
}
