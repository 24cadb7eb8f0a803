//! Generation results.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::{FileId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// Outcome of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileResult {
    pub file_id: FileId,
    /// Original image filename
    pub filename: String,
    pub status: ResultStatus,
    /// Model URL returned by the generator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    /// API path serving the stored model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Name of the stored model file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    pub fn failed(file_id: FileId, filename: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            file_id,
            filename: filename.into(),
            status: ResultStatus::Failed,
            model_url: None,
            download_url: None,
            model_filename: None,
            rendered_image_url: None,
            content_type: None,
            size_bytes: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Completed
    }
}

/// All results of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobResults {
    pub job_id: JobId,
    pub files: Vec<FileResult>,
    pub completed_at: DateTime<Utc>,
}

impl JobResults {
    pub fn new(job_id: JobId, files: Vec<FileResult>) -> Self {
        Self {
            job_id,
            files,
            completed_at: Utc::now(),
        }
    }

    pub fn success_count(&self) -> u32 {
        self.files.iter().filter(|f| f.is_success()).count() as u32
    }

    pub fn failure_count(&self) -> u32 {
        self.files.len() as u32 - self.success_count()
    }
}
