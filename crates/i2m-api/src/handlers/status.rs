//! Task status handlers.
//!
//! Provides REST API endpoints for:
//! - Getting a job's status and batch progress (polling fallback for SSE)
//! - Getting the results record once the job finished

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use i2m_models::{BatchProgress, FileProgress, Job, JobResults, JobStatus};

use crate::auth::{authorize_job, ApiCaller, SessionHeader};
use crate::error::{ApiError, ApiResult};
use crate::security::parse_job_id;
use crate::state::AppState;

/// Task status response.
#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    /// Overall progress percentage (0-100)
    pub progress: u8,
    pub total_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-file progress
    pub batch: BatchProgress,
    /// Results endpoint, once the job is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_url: Option<String>,
}

/// Batch progress for a job, falling back to the job record when the
/// progress hash has expired.
pub(crate) fn batch_or_fallback(job: &Job, snapshot: Option<BatchProgress>) -> BatchProgress {
    match snapshot {
        Some(mut batch) => {
            // The job record is authoritative for the task state
            if job.status.is_terminal() && !batch.status.is_terminal() {
                batch.status = job.status;
                batch.progress = 100;
            }
            batch
        }
        None => {
            let files = job
                .files
                .iter()
                .map(|f| FileProgress::pending(f.file_id.clone(), f.filename.clone()))
                .collect();
            BatchProgress::aggregate(job.job_id.clone(), job.status, job.total_files, files, 0)
        }
    }
}

/// GET /api/v1/status/tasks/:job_id
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    caller: ApiCaller,
    session: SessionHeader,
) -> ApiResult<Json<TaskStatusResponse>> {
    let job_id = parse_job_id(&job_id)?;
    authorize_job(&state, &caller, &session, &job_id).await?;

    let job = state
        .jobs
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Task not found"))?;

    let snapshot = state.progress.snapshot(&job_id).await?;
    let batch = batch_or_fallback(&job, snapshot);

    Ok(Json(TaskStatusResponse {
        job_id: job.job_id.to_string(),
        status: job.status,
        progress: batch.progress,
        total_files: job.total_files,
        completed_files: batch.completed.max(job.completed_files),
        failed_files: batch.failed.max(job.failed_files),
        error_message: job.error_message.clone(),
        created_at: job.created_at,
        updated_at: job.updated_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        results_url: job
            .status
            .is_terminal()
            .then(|| format!("/api/v1/status/jobs/{}/results", job.job_id)),
        batch,
    }))
}

/// GET /api/v1/status/jobs/:job_id/results
pub async fn get_job_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    caller: ApiCaller,
    session: SessionHeader,
) -> ApiResult<Json<JobResults>> {
    let job_id = parse_job_id(&job_id)?;
    authorize_job(&state, &caller, &session, &job_id).await?;

    let results = state
        .jobs
        .get_results(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Results are not available yet"))?;

    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use i2m_models::{FileEntry, FileId, FileStatus, GenerationOptions};

    fn job() -> Job {
        let files = ["a.png", "b.png"]
            .iter()
            .map(|name| FileEntry {
                file_id: FileId::new(),
                filename: name.to_string(),
                stored_name: format!("{}.png", name),
                content_type: "image/png".to_string(),
                size_bytes: 10,
            })
            .collect();
        Job::new(None, files, GenerationOptions::default())
    }

    #[test]
    fn test_fallback_without_progress_record() {
        let job = job();
        let batch = batch_or_fallback(&job, None);
        assert_eq!(batch.total, 2);
        assert_eq!(batch.files.len(), 2);
        assert_eq!(batch.progress, 0);
        assert!(batch.files.iter().all(|f| f.status == FileStatus::Pending));
    }

    #[test]
    fn test_terminal_job_overrides_stale_progress() {
        let mut job = job();
        job.transition(JobStatus::Processing).unwrap();
        job.fail("worker lost").unwrap();

        let stale = BatchProgress::aggregate(job.job_id.clone(), JobStatus::Processing, 2, vec![], 3);
        let batch = batch_or_fallback(&job, Some(stale));
        assert_eq!(batch.status, JobStatus::Failed);
        assert_eq!(batch.progress, 100);
        assert_eq!(batch.seq, 3);
    }
}
