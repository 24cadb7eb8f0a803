//! Job records, ownership, results and liveness tracking.

use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use i2m_models::{Job, JobId, JobResults, JobStatus, SessionId};

use crate::error::{StoreError, StoreResult};
use crate::keys::{
    self, ACTIVE_JOBS_KEY, HEARTBEAT_TTL_SECS, JOB_TTL_SECS, RECENT_JOBS_KEY,
    STALE_GRACE_PERIOD_SECS, STALE_THRESHOLD_SECS,
};

/// Outcome of an ownership check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerCheck {
    /// The caller's session created the job
    Owner,
    /// The job has no recorded owner
    Unowned,
    /// The job belongs to another session
    Denied,
}

impl OwnerCheck {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, OwnerCheck::Denied)
    }
}

/// Redis-backed job store.
#[derive(Clone)]
pub struct JobStore {
    client: redis::Client,
}

impl JobStore {
    /// Create a new job store.
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Create a job store sharing an existing client.
    pub fn from_client(client: redis::Client) -> Self {
        Self { client }
    }

    async fn conn(&self) -> StoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Persist a new job with its owner and index it as recent.
    pub async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job)?;
        let created = job.created_at.timestamp();
        let cutoff = created - JOB_TTL_SECS as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(keys::job(&job.job_id), payload, JOB_TTL_SECS)
            .ignore()
            .zadd(RECENT_JOBS_KEY, job.job_id.as_str(), created)
            .ignore()
            .zrembyscore(RECENT_JOBS_KEY, "-inf", cutoff)
            .ignore();

        if let Some(session_id) = &job.session_id {
            pipe.set_ex(keys::job_owner(&job.job_id), session_id.as_str(), JOB_TTL_SECS)
                .ignore();
        }

        pipe.query_async::<()>(&mut conn).await?;

        info!(
            job_id = %job.job_id,
            total_files = job.total_files,
            "Created job"
        );
        Ok(())
    }

    /// Load a job record.
    pub async fn get_job(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(keys::job(job_id)).await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Load a job record, failing if it does not exist.
    pub async fn require_job(&self, job_id: &JobId) -> StoreResult<Job> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::job_not_found(job_id.as_str()))
    }

    /// Overwrite a job record and refresh its TTL.
    pub async fn save_job(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job)?;
        conn.set_ex::<_, _, ()>(keys::job(&job.job_id), payload, JOB_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Move a job to a new status, enforcing the state machine.
    pub async fn update_status(
        &self,
        job_id: &JobId,
        next: JobStatus,
        error: Option<String>,
    ) -> StoreResult<Job> {
        let mut job = self.require_job(job_id).await?;
        job.transition(next)?;
        if error.is_some() {
            job.error_message = error;
        }
        self.save_job(&job).await?;

        debug!(job_id = %job_id, status = %next, "Updated job status");
        Ok(job)
    }

    /// Session that created a job, if recorded.
    pub async fn get_owner(&self, job_id: &JobId) -> StoreResult<Option<SessionId>> {
        let mut conn = self.conn().await?;
        let owner: Option<String> = conn.get(keys::job_owner(job_id)).await?;
        Ok(owner.map(SessionId::from))
    }

    /// Check whether a session may read a job.
    pub async fn check_owner(
        &self,
        job_id: &JobId,
        session_id: Option<&SessionId>,
    ) -> StoreResult<OwnerCheck> {
        let owner = self.get_owner(job_id).await?;
        Ok(match (owner, session_id) {
            (None, _) => OwnerCheck::Unowned,
            (Some(owner), Some(session)) if &owner == session => OwnerCheck::Owner,
            (Some(_), _) => OwnerCheck::Denied,
        })
    }

    /// Persist the results of a job.
    pub async fn store_results(&self, results: &JobResults) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(results)?;
        conn.set_ex::<_, _, ()>(keys::job_results(&results.job_id), payload, JOB_TTL_SECS)
            .await?;
        Ok(())
    }

    pub async fn get_results(&self, job_id: &JobId) -> StoreResult<Option<JobResults>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.get(keys::job_results(job_id)).await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recent jobs, newest first. Expired records are skipped.
    pub async fn list_recent(&self, limit: usize) -> StoreResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrevrange(RECENT_JOBS_KEY, 0, limit as isize - 1)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let job_keys: Vec<String> = ids
            .iter()
            .map(|id| keys::job(&JobId::from_string(id.as_str())))
            .collect();
        let payloads: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads.into_iter().flatten() {
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job record: {}", e),
            }
        }
        Ok(jobs)
    }

    /// Load several jobs by ID, preserving order and skipping expired ones.
    pub async fn get_jobs(&self, job_ids: &[JobId]) -> StoreResult<Vec<Job>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let job_keys: Vec<String> = job_ids.iter().map(keys::job).collect();
        let payloads: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads.into_iter().flatten() {
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job record: {}", e),
            }
        }
        Ok(jobs)
    }

    /// Remove every key belonging to a job. Returns whether the record existed.
    pub async fn delete_job(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let related: Vec<String> = keys::all_for_job(job_id).into_iter().skip(1).collect();
        let (deleted,): (u32,) = redis::pipe()
            .atomic()
            .del(keys::job(job_id))
            .del(related)
            .ignore()
            .zrem(RECENT_JOBS_KEY, job_id.as_str())
            .ignore()
            .srem(ACTIVE_JOBS_KEY, job_id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(job_id = %job_id, existed = deleted > 0, "Deleted job");
        Ok(deleted > 0)
    }

    /// Refresh the worker heartbeat for a running job.
    pub async fn record_heartbeat(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(
            keys::heartbeat(job_id),
            Utc::now().timestamp(),
            HEARTBEAT_TTL_SECS,
        )
        .await?;
        Ok(())
    }

    pub async fn last_heartbeat(&self, job_id: &JobId) -> StoreResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn().await?;
        let ts: Option<i64> = conn.get(keys::heartbeat(job_id)).await?;
        Ok(ts.and_then(|t| Utc.timestamp_opt(t, 0).single()))
    }

    /// Whether a worker is still processing the job, judged by its heartbeat.
    pub async fn has_live_worker(&self, job_id: &JobId) -> StoreResult<bool> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing {
            return Ok(false);
        }
        let beat = self.last_heartbeat(job_id).await?;
        Ok(!is_stale(&job, beat, Utc::now()))
    }

    pub async fn mark_active(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(ACTIVE_JOBS_KEY, job_id.as_str()).await?;
        Ok(())
    }

    /// Remove a job from the active set and drop its heartbeat.
    pub async fn mark_inactive(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .srem(ACTIVE_JOBS_KEY, job_id.as_str())
            .ignore()
            .del(keys::heartbeat(job_id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn active_jobs(&self) -> StoreResult<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(ACTIVE_JOBS_KEY).await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }
}

/// Whether a running job should be considered abandoned.
///
/// A job with a heartbeat is stale once the heartbeat is older than
/// [`STALE_THRESHOLD_SECS`]. A job without one is stale once it has been
/// running longer than [`STALE_GRACE_PERIOD_SECS`].
pub fn is_stale(
    job: &Job,
    last_heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if job.status.is_terminal() {
        return false;
    }

    match last_heartbeat {
        Some(beat) => (now - beat).num_seconds() > STALE_THRESHOLD_SECS,
        None => {
            let started = job.started_at.unwrap_or(job.created_at);
            (now - started).num_seconds() > STALE_GRACE_PERIOD_SECS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use i2m_models::GenerationOptions;

    fn running_job(started_secs_ago: i64) -> Job {
        let mut job = Job::new(None, vec![], GenerationOptions::default());
        job.transition(JobStatus::Processing).unwrap();
        job.started_at = Some(Utc::now() - Duration::seconds(started_secs_ago));
        job
    }

    #[test]
    fn test_fresh_heartbeat_is_not_stale() {
        let job = running_job(1000);
        let now = Utc::now();
        assert!(!is_stale(&job, Some(now - Duration::seconds(10)), now));
    }

    #[test]
    fn test_old_heartbeat_is_stale() {
        let job = running_job(1000);
        let now = Utc::now();
        assert!(is_stale(&job, Some(now - Duration::seconds(121)), now));
    }

    #[test]
    fn test_missing_heartbeat_uses_grace_period() {
        let now = Utc::now();
        assert!(!is_stale(&running_job(60), None, now));
        assert!(is_stale(&running_job(301), None, now));
    }

    #[test]
    fn test_terminal_job_never_stale() {
        let mut job = running_job(10_000);
        job.transition(JobStatus::Completed).unwrap();
        assert!(!is_stale(&job, None, Utc::now()));
    }

    #[test]
    fn test_owner_check_allowed() {
        assert!(OwnerCheck::Owner.is_allowed());
        assert!(OwnerCheck::Unowned.is_allowed());
        assert!(!OwnerCheck::Denied.is_allowed());
    }
}
