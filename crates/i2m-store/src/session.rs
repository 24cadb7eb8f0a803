//! Browser sessions.
//!
//! A session is a hash of timestamps at `session:{id}` plus a list of job
//! IDs at `session:{id}:jobs`. Adding a job is a single MULTI block, so
//! concurrent uploads from one session never drop each other's jobs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::debug;

use i2m_models::session::MAX_SESSION_JOBS;
use i2m_models::{JobId, Session, SessionId};

use crate::error::{StoreError, StoreResult};
use crate::keys::{self, SESSION_TTL_SECS};

const FIELD_CREATED_AT: &str = "created_at";
const FIELD_LAST_SEEN: &str = "last_seen";

/// Redis-backed session store.
#[derive(Clone)]
pub struct SessionStore {
    client: redis::Client,
}

impl SessionStore {
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self { client }
    }

    async fn conn(&self) -> StoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))
    }

    pub async fn get(&self, session_id: &SessionId) -> StoreResult<Option<Session>> {
        let mut conn = self.conn().await?;
        let (fields, job_ids): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(keys::session(session_id))
            .lrange(keys::session_jobs(session_id), 0, -1)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        Ok(Some(Session {
            session_id: session_id.clone(),
            created_at: parse_time(fields.get(FIELD_CREATED_AT)).unwrap_or(now),
            last_seen: parse_time(fields.get(FIELD_LAST_SEEN)).unwrap_or(now),
            job_ids: job_ids.into_iter().map(JobId::from).collect(),
        }))
    }

    /// Create the session if needed and refresh its TTL.
    pub async fn touch(&self, session_id: &SessionId) -> StoreResult<Session> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        refresh(&mut pipe, session_id);
        pipe.query_async::<()>(&mut conn).await?;

        self.get_or_new(session_id).await
    }

    /// Remember a job under a session, newest first, keeping the latest
    /// [`MAX_SESSION_JOBS`].
    pub async fn add_job(&self, session_id: &SessionId, job_id: &JobId) -> StoreResult<Session> {
        let mut conn = self.conn().await?;
        let jobs_key = keys::session_jobs(session_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        refresh(&mut pipe, session_id);
        pipe.lrem(&jobs_key, 0, job_id.as_str())
            .ignore()
            .lpush(&jobs_key, job_id.as_str())
            .ignore()
            .ltrim(&jobs_key, 0, MAX_SESSION_JOBS as isize - 1)
            .ignore()
            .expire(&jobs_key, SESSION_TTL_SECS as i64)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        debug!(session_id = %session_id, job_id = %job_id, "Added job to session");
        self.get_or_new(session_id).await
    }

    /// Forget a job. Missing sessions and unknown jobs are ignored.
    pub async fn remove_job(&self, session_id: &SessionId, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("LREM")
            .arg(keys::session_jobs(session_id))
            .arg(0)
            .arg(job_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;

        debug!(session_id = %session_id, job_id = %job_id, "Removed job from session");
        Ok(())
    }

    async fn get_or_new(&self, session_id: &SessionId) -> StoreResult<Session> {
        Ok(self
            .get(session_id)
            .await?
            .unwrap_or_else(|| Session::new(session_id.clone())))
    }
}

/// Queue the writes that create or refresh a session record.
fn refresh(pipe: &mut redis::Pipeline, session_id: &SessionId) {
    let key = keys::session(session_id);
    let now = Utc::now().to_rfc3339();
    pipe.hset_nx(&key, FIELD_CREATED_AT, &now)
        .ignore()
        .hset(&key, FIELD_LAST_SEEN, &now)
        .ignore()
        .expire(&key, SESSION_TTL_SECS as i64)
        .ignore()
        .expire(keys::session_jobs(session_id), SESSION_TTL_SECS as i64)
        .ignore();
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        let now = Utc::now();
        let raw = now.to_rfc3339();
        assert_eq!(parse_time(Some(&raw)), Some(now));
        assert_eq!(parse_time(Some(&"yesterday".to_string())), None);
        assert_eq!(parse_time(None), None);
    }
}
