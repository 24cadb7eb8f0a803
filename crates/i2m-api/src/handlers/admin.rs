//! Admin handlers for job inspection, cleanup and system monitoring.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use i2m_models::{BatchProgress, Job, JobResults, SessionId};

use crate::auth::AdminCaller;
use crate::error::{ApiError, ApiResult};
use crate::handlers::session::JobSummary;
use crate::metrics;
use crate::security::parse_job_id;
use crate::state::AppState;

const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobSummary>,
    pub total: usize,
}

/// GET /api/v1/admin/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<ListJobsResponse>> {
    let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
    let jobs = state.jobs.list_recent(limit).await?;
    let jobs: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();

    Ok(Json(ListJobsResponse {
        total: jobs.len(),
        jobs,
    }))
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<BatchProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<JobResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// GET /api/v1/admin/jobs/:job_id
pub async fn get_job_detail(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobDetailResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state
        .jobs
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    Ok(Json(JobDetailResponse {
        progress: state.progress.snapshot(&job_id).await?,
        results: state.jobs.get_results(&job_id).await?,
        owner: state.jobs.get_owner(&job_id).await?,
        last_heartbeat: state.jobs.last_heartbeat(&job_id).await?,
        job,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteJobResponse {
    pub job_id: String,
    pub deleted_records: bool,
    pub deleted_files: bool,
}

/// DELETE /api/v1/admin/jobs/:job_id
///
/// Removes every Redis key of the job, its entry in the owner session's job
/// list and its upload and output directories.
pub async fn delete_job(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(job_id): Path<String>,
) -> ApiResult<Json<DeleteJobResponse>> {
    let job_id = parse_job_id(&job_id)?;

    // The owner key goes with the job, so read it first
    let owner = state.jobs.get_owner(&job_id).await?;
    let deleted_records = state.jobs.delete_job(&job_id).await?;
    if let Some(session_id) = &owner {
        state.sessions.remove_job(session_id, &job_id).await?;
    }
    let deleted_files = state.storage.delete_job_files(&job_id).await?;

    if !deleted_records && !deleted_files {
        return Err(ApiError::not_found("Job not found"));
    }

    info!(
        job_id = %job_id,
        deleted_records,
        deleted_files,
        "Admin deleted job"
    );

    Ok(Json(DeleteJobResponse {
        job_id: job_id.to_string(),
        deleted_records,
        deleted_files,
    }))
}

/// Effective limits, reported by the system info endpoint.
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub environment: String,
    pub max_upload_bytes: usize,
    pub max_files_per_batch: usize,
    pub rate_limit_per_minute: u32,
    pub upload_rate_limit_per_minute: u32,
    pub max_streams_per_session: usize,
    pub sse_poll_interval_secs: u64,
    pub sse_max_duration_secs: u64,
    pub auth_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct SystemInfoResponse {
    pub version: String,
    pub queue_length: u64,
    pub dlq_length: u64,
    pub active_jobs: usize,
    pub active_streams: usize,
    pub config: ConfigSummary,
    pub timestamp: DateTime<Utc>,
}

/// GET /api/v1/admin/system/info
pub async fn get_system_info(
    State(state): State<AppState>,
    _admin: AdminCaller,
) -> ApiResult<Json<SystemInfoResponse>> {
    let queue_length = state.queue.len().await?;
    let dlq_length = state.queue.dlq_len().await?;
    let active_jobs = state.jobs.active_jobs().await?.len();

    metrics::set_queue_length(queue_length);
    metrics::set_dlq_length(dlq_length);

    let config = &state.config;
    Ok(Json(SystemInfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_length,
        dlq_length,
        active_jobs,
        active_streams: state.streams.total(),
        config: ConfigSummary {
            environment: config.environment.clone(),
            max_upload_bytes: config.max_upload_bytes,
            max_files_per_batch: config.max_files_per_batch,
            rate_limit_per_minute: config.rate_limit_per_minute,
            upload_rate_limit_per_minute: config.upload_rate_limit_per_minute,
            max_streams_per_session: config.max_streams_per_session,
            sse_poll_interval_secs: config.sse_poll_interval.as_secs(),
            sse_max_duration_secs: config.sse_max_duration.as_secs(),
            auth_enabled: config.api_key.is_some(),
        },
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CleanupQuery {
    #[serde(default = "default_max_age_hours")]
    #[validate(range(min = 1, max = 720))]
    pub max_age_hours: u64,
}

fn default_max_age_hours() -> u64 {
    24
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed_directories: u32,
    pub max_age_hours: u64,
}

/// POST /api/v1/admin/cleanup?max_age_hours=24
pub async fn cleanup_files(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<CleanupResponse>> {
    query
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let removed = state
        .storage
        .cleanup_older_than(Duration::from_secs(query.max_age_hours * 3600))
        .await?;

    info!(
        removed,
        max_age_hours = query.max_age_hours,
        "Admin cleanup finished"
    );

    Ok(Json(CleanupResponse {
        removed_directories: removed,
        max_age_hours: query.max_age_hours,
    }))
}
