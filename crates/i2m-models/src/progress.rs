//! Per-file progress and batch aggregation.
//!
//! Each file of a job reports its own [`FileProgress`]. The store keeps
//! them as separate hash fields so concurrent file tasks never clobber each
//! other; readers fold them into a [`BatchProgress`] snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::{FileId, JobId};
use crate::job::JobStatus;

/// Processing state of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Waiting for a processing slot
    #[default]
    Pending,
    /// Sending the image to the generator
    Uploading,
    /// Waiting in the generator's queue
    Queued,
    /// Generator is building the model
    Processing,
    /// Model generated and stored
    Completed,
    /// Generation failed
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Queued => "queued",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileProgress {
    pub file_id: FileId,
    pub filename: String,
    pub status: FileStatus,
    /// Progress percentage (0-100)
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Position in the generator's queue, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FileProgress {
    /// Initial entry for a freshly uploaded file.
    pub fn pending(file_id: FileId, filename: impl Into<String>) -> Self {
        Self {
            file_id,
            filename: filename.into(),
            status: FileStatus::Pending,
            progress: 0,
            message: None,
            queue_position: None,
            model_url: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Copy with a new status and progress value.
    ///
    /// Progress never moves backwards and terminal states pin it to 100.
    pub fn with_status(&self, status: FileStatus, progress: u8) -> Self {
        let progress = if status.is_terminal() {
            100
        } else {
            progress.min(99).max(self.progress)
        };
        Self {
            status,
            progress,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_queue_position(mut self, position: Option<u32>) -> Self {
        self.queue_position = position;
        self
    }

    pub fn with_model_url(mut self, url: impl Into<String>) -> Self {
        self.model_url = Some(url.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Contribution of this file to the overall batch percentage.
    fn effective_progress(&self) -> u32 {
        if self.status.is_terminal() {
            100
        } else {
            u32::from(self.progress.min(100))
        }
    }
}

/// Aggregated progress of every file in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Number of files in the batch
    pub total: u32,
    /// Files that produced a model
    pub completed: u32,
    /// Files that failed
    pub failed: u32,
    /// Files actively being worked on
    pub processing: u32,
    /// Overall progress percentage (0-100)
    pub progress: u8,
    /// Per-file detail, in filename order
    pub files: Vec<FileProgress>,
    /// Sequence number of the last progress event
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl BatchProgress {
    /// Fold per-file progress into a batch snapshot.
    ///
    /// Files the store has no entry for yet count as pending with 0%.
    pub fn aggregate(
        job_id: JobId,
        status: JobStatus,
        total: u32,
        mut files: Vec<FileProgress>,
        seq: u64,
    ) -> Self {
        files.sort_by(|a, b| a.filename.cmp(&b.filename).then(a.file_id.cmp(&b.file_id)));

        let completed = files.iter().filter(|f| f.status == FileStatus::Completed).count() as u32;
        let failed = files.iter().filter(|f| f.status == FileStatus::Failed).count() as u32;
        let processing = files
            .iter()
            .filter(|f| !f.status.is_terminal() && f.status != FileStatus::Pending)
            .count() as u32;

        let total = total.max(files.len() as u32);
        let progress = if status.is_terminal() {
            100
        } else if total == 0 {
            0
        } else {
            let sum: u32 = files.iter().map(FileProgress::effective_progress).sum();
            (sum / total).min(100) as u8
        };

        let updated_at = files
            .iter()
            .map(|f| f.updated_at)
            .max()
            .unwrap_or_else(Utc::now);

        Self {
            job_id,
            status,
            total,
            completed,
            failed,
            processing,
            progress,
            files,
            seq,
            updated_at,
        }
    }

    /// Whether every file has a terminal state.
    pub fn all_files_finished(&self) -> bool {
        self.completed + self.failed >= self.total
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
