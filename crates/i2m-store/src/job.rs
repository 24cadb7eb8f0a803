//! Job types for the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use i2m_models::{FileId, GenerationOptions, Job, JobId, SessionId};

/// One file to generate a model from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFile {
    pub file_id: FileId,
    /// Original (sanitized) filename
    pub filename: String,
    /// Name inside the job's upload directory
    pub stored_name: String,
    pub content_type: String,
}

/// Job to generate 3D models for every image of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateModelsJob {
    /// Unique job ID
    pub job_id: JobId,
    /// Session that created the job
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Files of the batch
    pub files: Vec<JobFile>,
    /// Options applied to every file
    #[serde(default)]
    pub options: GenerationOptions,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl GenerateModelsJob {
    /// Build the queue message for a freshly created job record.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            session_id: job.session_id.clone(),
            files: job
                .files
                .iter()
                .map(|f| JobFile {
                    file_id: f.file_id.clone(),
                    filename: f.filename.clone(),
                    stored_name: f.stored_name.clone(),
                    content_type: f.content_type.clone(),
                })
                .collect(),
            options: job.options.clone(),
            created_at: job.created_at,
        }
    }

    /// Get the job ID.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("generate:{}", self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use i2m_models::FileEntry;

    #[test]
    fn test_from_job() {
        let job = Job::new(
            Some(SessionId::new()),
            vec![FileEntry {
                file_id: FileId::new(),
                filename: "cat.png".to_string(),
                stored_name: "abc.png".to_string(),
                content_type: "image/png".to_string(),
                size_bytes: 10,
            }],
            GenerationOptions::default(),
        );

        let queued = GenerateModelsJob::from_job(&job);
        assert_eq!(queued.job_id, job.job_id);
        assert_eq!(queued.files.len(), 1);
        assert_eq!(queued.files[0].stored_name, "abc.png");
        assert_eq!(queued.idempotency_key(), format!("generate:{}", job.job_id));
    }

    #[test]
    fn test_serialization_round_trip() {
        let job = Job::new(None, vec![], GenerationOptions::default());
        let queued = GenerateModelsJob::from_job(&job);
        let json = serde_json::to_string(&queued).unwrap();
        let back: GenerateModelsJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, queued.job_id);
        assert!(back.session_id.is_none());
    }
}
