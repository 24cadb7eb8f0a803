//! Session job listing.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use i2m_models::{Job, JobStatus};

use crate::auth::{ApiCaller, SessionHeader};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Compact job view used by listings.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub total_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            status: job.status,
            total_files: job.total_files,
            completed_files: job.completed_files,
            failed_files: job.failed_files,
            session_id: job.session_id.as_ref().map(|s| s.to_string()),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionJobsResponse {
    pub session_id: String,
    pub jobs: Vec<JobSummary>,
    pub total: usize,
}

/// GET /api/v1/session/jobs
///
/// Jobs created by the session in `X-Session-ID`, newest first. Jobs whose
/// record has expired are left out.
pub async fn list_session_jobs(
    State(state): State<AppState>,
    _caller: ApiCaller,
    session: SessionHeader,
) -> ApiResult<Json<SessionJobsResponse>> {
    let session_id = session
        .0
        .ok_or_else(|| ApiError::bad_request("Missing X-Session-ID header"))?;

    let jobs = match state.sessions.get(&session_id).await? {
        Some(record) => state.jobs.get_jobs(&record.job_ids).await?,
        None => Vec::new(),
    };

    let jobs: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();

    Ok(Json(SessionJobsResponse {
        session_id: session_id.to_string(),
        total: jobs.len(),
        jobs,
    }))
}
