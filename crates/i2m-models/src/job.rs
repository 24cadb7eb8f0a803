//! Job record and task state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::ids::{FileId, JobId, SessionId};
use crate::options::GenerationOptions;

/// Task state of a job.
///
/// `pending -> processing -> completed | failed`, and `pending -> failed`
/// for jobs that never start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is queued waiting for a worker
    #[default]
    Pending,
    /// Job is being processed
    Processing,
    /// All files finished and at least one model was generated
    Completed,
    /// Job failed
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// One uploaded image belonging to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileEntry {
    /// File ID
    pub file_id: FileId,
    /// Sanitized original filename
    pub filename: String,
    /// Name of the file inside the job's upload directory
    pub stored_name: String,
    /// MIME type detected from the file content
    pub content_type: String,
    /// Size in bytes
    pub size_bytes: u64,
}

/// A user-initiated batch of image uploads.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub job_id: JobId,

    /// Session that created the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    /// Task state
    #[serde(default)]
    pub status: JobStatus,

    /// Number of files in the batch
    pub total_files: u32,

    /// Files that produced a model
    #[serde(default)]
    pub completed_files: u32,

    /// Files that failed
    #[serde(default)]
    pub failed_files: u32,

    /// Uploaded files
    #[serde(default)]
    pub files: Vec<FileEntry>,

    /// Generation options applied to every file
    #[serde(default)]
    pub options: GenerationOptions,

    /// Error message if the job failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Started at timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Finished at timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        session_id: Option<SessionId>,
        files: Vec<FileEntry>,
        options: GenerationOptions,
    ) -> Self {
        Self::with_id(JobId::new(), session_id, files, options)
    }

    /// Create a new pending job with a pre-generated ID.
    ///
    /// The API generates the ID first so uploaded files can be written under it.
    pub fn with_id(
        job_id: JobId,
        session_id: Option<SessionId>,
        files: Vec<FileEntry>,
        options: GenerationOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            session_id,
            status: JobStatus::Pending,
            total_files: files.len() as u32,
            completed_files: 0,
            failed_files: 0,
            files,
            options,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job to a new status, enforcing the state machine.
    pub fn transition(&mut self, next: JobStatus) -> ModelResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Processing => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed => self.finished_at = Some(now),
            JobStatus::Pending => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Mark the job as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) -> ModelResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Count the outcome of one file.
    pub fn record_file_outcome(&mut self, success: bool) {
        if success {
            self.completed_files += 1;
        } else {
            self.failed_files += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Whether every file has reached an outcome.
    pub fn is_finished(&self) -> bool {
        self.completed_files + self.failed_files >= self.total_files
    }

    /// Status the job should end in once all files are finished.
    pub fn final_status(&self) -> JobStatus {
        if self.completed_files > 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }

    /// Find a file entry by ID.
    pub fn file(&self, file_id: &FileId) -> Option<&FileEntry> {
        self.files.iter().find(|f| &f.file_id == file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> FileEntry {
        FileEntry {
            file_id: FileId::new(),
            filename: name.to_string(),
            stored_name: format!("{}.png", name),
            content_type: "image/png".to_string(),
            size_bytes: 1024,
        }
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new(None, vec![entry("a"), entry("b")], GenerationOptions::default());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_files, 2);
        assert!(!job.is_finished());
    }

    #[test]
    fn test_status_transitions() {
        let mut job = Job::new(None, vec![entry("a")], GenerationOptions::default());

        job.transition(JobStatus::Processing).unwrap();
        assert!(job.started_at.is_some());

        job.transition(JobStatus::Completed).unwrap();
        assert!(job.finished_at.is_some());
        assert!(job.status.is_terminal());

        let err = job.transition(JobStatus::Processing).unwrap_err();
        assert_eq!(
            err,
            ModelError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Processing,
            }
        );
    }

    #[test]
    fn test_pending_can_fail_but_not_complete() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_final_status() {
        let mut job = Job::new(None, vec![entry("a"), entry("b")], GenerationOptions::default());
        job.record_file_outcome(false);
        job.record_file_outcome(true);
        assert!(job.is_finished());
        assert_eq!(job.final_status(), JobStatus::Completed);

        let mut job = Job::new(None, vec![entry("a")], GenerationOptions::default());
        job.record_file_outcome(false);
        assert_eq!(job.final_status(), JobStatus::Failed);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("stale".parse::<JobStatus>().is_err());
    }
}
