//! Image upload handlers.
//!
//! Both endpoints validate every file before anything is written, store the
//! images under a fresh job id, create the job, ownership and progress
//! records, then enqueue one `GenerateModelsJob` for the whole batch.

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, info, warn};
use validator::Validate;

use i2m_models::{
    sanitize_filename, FileEntry, FileId, GenerationOptions, Job, JobId, JobStatus, Orientation,
    SessionId, TextureQuality,
};
use i2m_store::{GenerateModelsJob, StoreError};

use crate::auth::{ApiCaller, SessionHeader, SESSION_HEADER};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::security::validate_image;
use crate::state::AppState;

/// One file accepted from the form.
struct UploadedFile {
    file_id: FileId,
    filename: String,
    content_type: &'static str,
    extension: &'static str,
    bytes: Vec<u8>,
}

/// Parsed multipart form.
struct UploadForm {
    files: Vec<UploadedFile>,
    options: GenerationOptions,
}

/// File as reported back to the client.
#[derive(Debug, Serialize)]
pub struct UploadedFileInfo {
    pub file_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Upload response.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub job_id: String,
    /// Same as `job_id`; used in task status URLs
    pub task_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub total_files: u32,
    pub files: Vec<UploadedFileInfo>,
    pub status_url: String,
    pub stream_url: String,
    pub options: GenerationOptions,
}

/// POST /api/v1/upload/image
///
/// Single image in the `file` field, plus optional generation option fields.
pub async fn upload_image(
    State(state): State<AppState>,
    _caller: ApiCaller,
    session: SessionHeader,
    multipart: Multipart,
) -> ApiResult<Response> {
    let form = read_form(multipart, "file", 1, state.config.max_upload_bytes).await?;
    create_job(&state, session, form, "single").await
}

/// POST /api/v1/upload/batch
///
/// Images in repeated `files` fields, plus optional generation option fields.
pub async fn upload_batch(
    State(state): State<AppState>,
    _caller: ApiCaller,
    session: SessionHeader,
    multipart: Multipart,
) -> ApiResult<Response> {
    let form = read_form(
        multipart,
        "files",
        state.config.max_files_per_batch,
        state.config.max_upload_bytes,
    )
    .await?;
    create_job(&state, session, form, "batch").await
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large(e.body_text())
    } else {
        ApiError::bad_request(format!("Invalid multipart body: {}", e.body_text()))
    }
}

async fn read_form(
    mut multipart: Multipart,
    file_field: &str,
    max_files: usize,
    max_bytes: usize,
) -> ApiResult<UploadForm> {
    let mut files = Vec::new();
    let mut options = GenerationOptions::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == file_field {
            if files.len() >= max_files {
                return Err(ApiError::bad_request(format!(
                    "Too many files: at most {} per upload",
                    max_files
                )));
            }

            let filename = sanitize_filename(field.file_name().unwrap_or("upload"));
            let declared = field.content_type().map(|s| s.to_string());
            let bytes = field.bytes().await.map_err(multipart_error)?;

            let detected = validate_image(&bytes, declared.as_deref(), max_bytes).map_err(|e| {
                warn!(filename = %filename, "Rejected upload: {}", e);
                e
            })?;

            files.push(UploadedFile {
                file_id: FileId::new(),
                filename,
                content_type: detected.content_type,
                extension: detected.extension,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            apply_option_field(&mut options, &name, value.trim())?;
        }
    }

    if files.is_empty() {
        return Err(ApiError::bad_request(format!(
            "No image provided in the '{}' field",
            file_field
        )));
    }

    options
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    Ok(UploadForm { files, options })
}

/// Apply one non-file form field to the generation options.
///
/// Unknown fields are ignored.
fn apply_option_field(options: &mut GenerationOptions, name: &str, value: &str) -> ApiResult<()> {
    match name {
        "texture" => options.texture = parse_bool(name, value)?,
        "pbr" => options.pbr = parse_bool(name, value)?,
        "texture_quality" => {
            options.texture_quality = match value {
                "standard" => TextureQuality::Standard,
                "detailed" | "hd" | "HD" => TextureQuality::Detailed,
                other => {
                    return Err(ApiError::validation(format!(
                        "texture_quality must be 'standard' or 'detailed', got '{}'",
                        other
                    )))
                }
            }
        }
        "orientation" => {
            options.orientation = match value {
                "default" => Orientation::Default,
                "align_image" => Orientation::AlignImage,
                other => {
                    return Err(ApiError::validation(format!(
                        "orientation must be 'default' or 'align_image', got '{}'",
                        other
                    )))
                }
            }
        }
        "face_limit" => {
            options.face_limit = if value.is_empty() {
                None
            } else {
                Some(value.parse().map_err(|_| {
                    ApiError::validation(format!("face_limit must be an integer, got '{}'", value))
                })?)
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_bool(name: &str, value: &str) -> ApiResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ApiError::validation(format!(
            "{} must be a boolean, got '{}'",
            name, value
        ))),
    }
}

async fn create_job(
    state: &AppState,
    session: SessionHeader,
    form: UploadForm,
    kind: &str,
) -> ApiResult<Response> {
    let session_id = session.0.unwrap_or_else(SessionId::new);
    let job_id = JobId::new();

    let mut entries = Vec::with_capacity(form.files.len());
    let mut total_bytes = 0u64;
    for file in &form.files {
        let stored_name = format!("{}.{}", file.file_id, file.extension);
        if let Err(e) = state
            .storage
            .save_upload(&job_id, &stored_name, &file.bytes)
            .await
        {
            state.storage.delete_job_files(&job_id).await.ok();
            return Err(e.into());
        }

        total_bytes += file.bytes.len() as u64;
        entries.push(FileEntry {
            file_id: file.file_id.clone(),
            filename: file.filename.clone(),
            stored_name,
            content_type: file.content_type.to_string(),
            size_bytes: file.bytes.len() as u64,
        });
    }

    let job = Job::with_id(job_id.clone(), Some(session_id.clone()), entries, form.options);

    if let Err(e) = register_job(state, &job, &session_id).await {
        state.storage.delete_job_files(&job_id).await.ok();
        return Err(e);
    }

    if let Err(e) = state.queue.enqueue(&GenerateModelsJob::from_job(&job)).await {
        error!(job_id = %job_id, "Failed to enqueue job: {}", e);
        state
            .jobs
            .update_status(&job_id, JobStatus::Failed, Some("Failed to queue job".to_string()))
            .await
            .ok();
        state.progress.set_status(&job_id, JobStatus::Failed).await.ok();
        return Err(match e {
            StoreError::Duplicate(_) => ApiError::Conflict("Job already queued".to_string()),
            other => other.into(),
        });
    }

    metrics::record_job_enqueued(kind, job.files.len());
    metrics::record_upload_bytes(total_bytes);

    info!(
        job_id = %job_id,
        session_id = %session_id,
        files = job.total_files,
        bytes = total_bytes,
        "Upload accepted"
    );

    let body = UploadResponse {
        job_id: job_id.to_string(),
        task_id: job_id.to_string(),
        session_id: session_id.to_string(),
        status: job.status,
        total_files: job.total_files,
        files: job
            .files
            .iter()
            .map(|f| UploadedFileInfo {
                file_id: f.file_id.to_string(),
                filename: f.filename.clone(),
                content_type: f.content_type.clone(),
                size_bytes: f.size_bytes,
            })
            .collect(),
        status_url: format!("/api/v1/status/tasks/{}", job_id),
        stream_url: format!("/api/v1/status/tasks/{}/stream", job_id),
        options: job.options.clone(),
    };

    let mut response = (StatusCode::ACCEPTED, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(session_id.as_str()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

/// Write the job, its progress record and the session index.
async fn register_job(state: &AppState, job: &Job, session_id: &SessionId) -> ApiResult<()> {
    state.jobs.create_job(job).await?;
    state.progress.init(job).await?;
    state.sessions.add_job(session_id, &job.job_id).await?;
    Ok(())
}
