//! Redis key layout and retention.

use i2m_models::{JobId, SessionId};

/// Jobs, owners and results live for 24 hours.
pub const JOB_TTL_SECS: u64 = 86_400;

/// Sessions live for 24 hours after their last upload.
pub const SESSION_TTL_SECS: u64 = 86_400;

/// Progress records live for 1 hour after their last update.
pub const PROGRESS_TTL_SECS: u64 = 3_600;

/// Heartbeat keys expire if the worker stops refreshing them.
pub const HEARTBEAT_TTL_SECS: u64 = 120;

/// A running job whose last heartbeat is older than this is stale.
pub const STALE_THRESHOLD_SECS: i64 = 120;

/// A running job that never sent a heartbeat is stale after this long.
pub const STALE_GRACE_PERIOD_SECS: i64 = 300;

/// Sorted set of job IDs scored by creation time.
pub const RECENT_JOBS_KEY: &str = "jobs:recent";

/// Set of jobs currently being processed.
pub const ACTIVE_JOBS_KEY: &str = "jobs:active";

pub fn job(job_id: &JobId) -> String {
    format!("job:{}", job_id)
}

pub fn job_owner(job_id: &JobId) -> String {
    format!("job_owner:{}", job_id)
}

pub fn job_results(job_id: &JobId) -> String {
    format!("job_results:{}", job_id)
}

/// Hash with `created_at` and `last_seen` fields.
pub fn session(session_id: &SessionId) -> String {
    format!("session:{}", session_id)
}

/// List of the session's job IDs, newest first.
pub fn session_jobs(session_id: &SessionId) -> String {
    format!("session:{}:jobs", session_id)
}

/// Hash with `meta`, `status` and `seq` fields.
pub fn progress(job_id: &JobId) -> String {
    format!("progress:{}", job_id)
}

/// Hash of file ID to `FileProgress` JSON.
pub fn progress_files(job_id: &JobId) -> String {
    format!("progress:{}:files", job_id)
}

/// Pub/Sub channel for a job's progress events.
pub fn progress_channel(job_id: &JobId) -> String {
    format!("progress_events:{}", job_id)
}

pub fn heartbeat(job_id: &JobId) -> String {
    format!("heartbeat:{}", job_id)
}

pub fn dedup(idempotency_key: &str) -> String {
    format!("i2m:dedup:{}", idempotency_key)
}

pub fn retry(message_id: &str) -> String {
    format!("i2m:retry:{}", message_id)
}

/// Every key that belongs to a job, for purging.
pub fn all_for_job(job_id: &JobId) -> Vec<String> {
    vec![
        job(job_id),
        job_owner(job_id),
        job_results(job_id),
        progress(job_id),
        progress_files(job_id),
        heartbeat(job_id),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let id = JobId::from_string("job-12345678");
        assert_eq!(job(&id), "job:job-12345678");
        assert_eq!(progress_files(&id), "progress:job-12345678:files");
        assert_eq!(progress_channel(&id), "progress_events:job-12345678");
        assert_eq!(all_for_job(&id).len(), 6);

        let session_id = SessionId::from_string("sess-1");
        assert_eq!(session(&session_id), "session:sess-1");
        assert_eq!(session_jobs(&session_id), "session:sess-1:jobs");
    }

    #[test]
    fn test_progress_outlives_nothing_it_depends_on() {
        assert!(PROGRESS_TTL_SECS < JOB_TTL_SECS);
        assert!(HEARTBEAT_TTL_SECS as i64 <= STALE_THRESHOLD_SECS);
    }
}
