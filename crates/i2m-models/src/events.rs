//! Server-Sent Event payloads.
//!
//! Published by the worker on the job's Redis channel and forwarded to
//! browsers by the SSE endpoint. Every event carries the job's progress
//! sequence number so readers can drop duplicates and stale replays.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::{FileId, JobId};
use crate::progress::{BatchProgress, FileProgress};

/// Event type names (the SSE `event:` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Snapshot,
    FileProgress,
    FileCompleted,
    FileFailed,
    TaskCompleted,
    TaskFailed,
    Timeout,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::Snapshot => "snapshot",
            StreamEventType::FileProgress => "file_progress",
            StreamEventType::FileCompleted => "file_completed",
            StreamEventType::FileFailed => "file_failed",
            StreamEventType::TaskCompleted => "task_completed",
            StreamEventType::TaskFailed => "task_failed",
            StreamEventType::Timeout => "timeout",
        }
    }
}

/// Event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Full state, sent first on every stream and on poll fallback
    Snapshot { seq: u64, progress: BatchProgress },

    /// One file changed state
    FileProgress {
        seq: u64,
        job_id: JobId,
        file: FileProgress,
        /// Overall batch percentage after this update
        overall_progress: u8,
    },

    /// One file produced a model
    FileCompleted {
        seq: u64,
        job_id: JobId,
        file_id: FileId,
        filename: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_url: Option<String>,
    },

    /// One file failed
    FileFailed {
        seq: u64,
        job_id: JobId,
        file_id: FileId,
        filename: String,
        error: String,
    },

    /// Job finished with at least one model
    TaskCompleted {
        seq: u64,
        job_id: JobId,
        total: u32,
        completed: u32,
        failed: u32,
        timestamp: DateTime<Utc>,
    },

    /// Job failed
    TaskFailed {
        seq: u64,
        job_id: JobId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Stream closed by the server before the job finished
    Timeout { seq: u64, job_id: JobId },
}

impl StreamEvent {
    /// Create a snapshot event from a batch progress record.
    pub fn snapshot(progress: BatchProgress) -> Self {
        StreamEvent::Snapshot {
            seq: progress.seq,
            progress,
        }
    }

    /// Create a task completed event.
    pub fn task_completed(job_id: JobId, total: u32, completed: u32, failed: u32) -> Self {
        StreamEvent::TaskCompleted {
            seq: 0,
            job_id,
            total,
            completed,
            failed,
            timestamp: Utc::now(),
        }
    }

    /// Create a task failed event.
    pub fn task_failed(job_id: JobId, error: impl Into<String>) -> Self {
        StreamEvent::TaskFailed {
            seq: 0,
            job_id,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn event_type(&self) -> StreamEventType {
        match self {
            StreamEvent::Snapshot { .. } => StreamEventType::Snapshot,
            StreamEvent::FileProgress { .. } => StreamEventType::FileProgress,
            StreamEvent::FileCompleted { .. } => StreamEventType::FileCompleted,
            StreamEvent::FileFailed { .. } => StreamEventType::FileFailed,
            StreamEvent::TaskCompleted { .. } => StreamEventType::TaskCompleted,
            StreamEvent::TaskFailed { .. } => StreamEventType::TaskFailed,
            StreamEvent::Timeout { .. } => StreamEventType::Timeout,
        }
    }

    /// SSE `event:` field value.
    pub fn event_name(&self) -> &'static str {
        self.event_type().as_str()
    }

    pub fn seq(&self) -> u64 {
        match self {
            StreamEvent::Snapshot { seq, .. }
            | StreamEvent::FileProgress { seq, .. }
            | StreamEvent::FileCompleted { seq, .. }
            | StreamEvent::FileFailed { seq, .. }
            | StreamEvent::TaskCompleted { seq, .. }
            | StreamEvent::TaskFailed { seq, .. }
            | StreamEvent::Timeout { seq, .. } => *seq,
        }
    }

    /// Stamp the event with the sequence number assigned by the store.
    pub fn with_seq(mut self, value: u64) -> Self {
        match &mut self {
            StreamEvent::Snapshot { seq, .. }
            | StreamEvent::FileProgress { seq, .. }
            | StreamEvent::FileCompleted { seq, .. }
            | StreamEvent::FileFailed { seq, .. }
            | StreamEvent::TaskCompleted { seq, .. }
            | StreamEvent::TaskFailed { seq, .. }
            | StreamEvent::Timeout { seq, .. } => *seq = value,
        }
        self
    }

    /// No events follow a terminal one.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::TaskCompleted { .. } | StreamEvent::TaskFailed { .. } => true,
            StreamEvent::Snapshot { progress, .. } => progress.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    #[test]
    fn test_event_tagging() {
        let event = StreamEvent::task_failed(JobId::from_string("job-12345678"), "boom").with_seq(4);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_failed");
        assert_eq!(json["seq"], 4);
        assert_eq!(event.event_name(), "task_failed");
        assert!(event.is_terminal());
    }

    #[test]
    fn test_snapshot_terminality_follows_status() {
        let running = BatchProgress::aggregate(JobId::new(), JobStatus::Processing, 1, vec![], 2);
        assert!(!StreamEvent::snapshot(running).is_terminal());

        let done = BatchProgress::aggregate(JobId::new(), JobStatus::Completed, 1, vec![], 9);
        let event = StreamEvent::snapshot(done);
        assert!(event.is_terminal());
        assert_eq!(event.seq(), 9);
    }

    #[test]
    fn test_event_deserializes() {
        let json = r#"{"type":"timeout","seq":3,"job_id":"job-12345678"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type(), StreamEventType::Timeout);
        assert_eq!(event.seq(), 3);
    }
}
