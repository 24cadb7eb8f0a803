//! Per-file progress records and progress events via Redis Pub/Sub.
//!
//! A job's progress lives in two hashes: `progress:{job_id}` holds the
//! batch metadata, job status and the event sequence counter, and
//! `progress:{job_id}:files` holds one field per file. Every write bumps the
//! counter in the same MULTI block, so the sequence gives a total order of
//! changes even with several file tasks writing at once.

use std::collections::HashMap;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use i2m_models::{BatchProgress, FileProgress, Job, JobId, JobStatus, StreamEvent};

use crate::error::{StoreError, StoreResult};
use crate::keys::{self, PROGRESS_TTL_SECS};

const FIELD_META: &str = "meta";
const FIELD_STATUS: &str = "status";
const FIELD_SEQ: &str = "seq";

/// Batch metadata stored under the `meta` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProgressMeta {
    job_id: JobId,
    total_files: u32,
    created_at: DateTime<Utc>,
}

/// Progress event published to Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    /// Job ID
    pub job_id: JobId,
    /// Stream event
    pub event: StreamEvent,
}

/// Boxed stream of progress messages for one job.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressMessage> + Send>>;

/// Progress records and the per-job event channel.
#[derive(Clone)]
pub struct ProgressStore {
    client: redis::Client,
}

impl ProgressStore {
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

    /// Create the progress record of a new job with every file pending.
    pub async fn init(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let meta_key = keys::progress(&job.job_id);
        let files_key = keys::progress_files(&job.job_id);

        let meta = serde_json::to_string(&ProgressMeta {
            job_id: job.job_id.clone(),
            total_files: job.total_files,
            created_at: job.created_at,
        })?;

        let mut files = Vec::with_capacity(job.files.len());
        for entry in &job.files {
            let progress = FileProgress::pending(entry.file_id.clone(), entry.filename.clone());
            files.push((entry.file_id.to_string(), serde_json::to_string(&progress)?));
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&meta_key)
            .ignore()
            .del(&files_key)
            .ignore()
            .hset_multiple(
                &meta_key,
                &[
                    (FIELD_META, meta.as_str()),
                    (FIELD_STATUS, job.status.as_str()),
                    (FIELD_SEQ, "0"),
                ],
            )
            .ignore()
            .expire(&meta_key, PROGRESS_TTL_SECS as i64)
            .ignore();

        if !files.is_empty() {
            pipe.hset_multiple(&files_key, &files)
                .ignore()
                .expire(&files_key, PROGRESS_TTL_SECS as i64)
                .ignore();
        }

        pipe.query_async::<()>(&mut conn).await?;
        debug!(job_id = %job.job_id, files = files.len(), "Initialized progress");
        Ok(())
    }

    /// Store one file's progress and return the new sequence number.
    pub async fn update_file(&self, job_id: &JobId, file: &FileProgress) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let meta_key = keys::progress(job_id);
        let files_key = keys::progress_files(job_id);
        let payload = serde_json::to_string(file)?;

        let (seq,): (u64,) = redis::pipe()
            .atomic()
            .hset(&files_key, file.file_id.as_str(), payload)
            .ignore()
            .hincr(&meta_key, FIELD_SEQ, 1)
            .expire(&files_key, PROGRESS_TTL_SECS as i64)
            .ignore()
            .expire(&meta_key, PROGRESS_TTL_SECS as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(seq)
    }

    /// Record the job status and return the new sequence number.
    pub async fn set_status(&self, job_id: &JobId, status: JobStatus) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let meta_key = keys::progress(job_id);

        let (seq,): (u64,) = redis::pipe()
            .atomic()
            .hset(&meta_key, FIELD_STATUS, status.as_str())
            .ignore()
            .hincr(&meta_key, FIELD_SEQ, 1)
            .expire(&meta_key, PROGRESS_TTL_SECS as i64)
            .ignore()
            .expire(keys::progress_files(job_id), PROGRESS_TTL_SECS as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(seq)
    }

    /// Current sequence number (0 if the record is missing).
    pub async fn seq(&self, job_id: &JobId) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let seq: Option<u64> = conn.hget(keys::progress(job_id), FIELD_SEQ).await?;
        Ok(seq.unwrap_or(0))
    }

    /// Fold the stored records into a batch snapshot.
    ///
    /// Returns `None` once the record has expired or was never created.
    pub async fn snapshot(&self, job_id: &JobId) -> StoreResult<Option<BatchProgress>> {
        let mut conn = self.conn().await?;
        let (meta, files): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(keys::progress(job_id))
            .hvals(keys::progress_files(job_id))
            .query_async(&mut conn)
            .await?;

        let Some(raw_meta) = meta.get(FIELD_META) else {
            return Ok(None);
        };
        let parsed: ProgressMeta = serde_json::from_str(raw_meta)?;

        let status = meta
            .get(FIELD_STATUS)
            .and_then(|s| s.parse::<JobStatus>().ok())
            .unwrap_or_default();
        let seq = meta
            .get(FIELD_SEQ)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mut file_progress = Vec::with_capacity(files.len());
        for raw in files {
            match serde_json::from_str::<FileProgress>(&raw) {
                Ok(p) => file_progress.push(p),
                Err(e) => warn!(job_id = %job_id, "Skipping unreadable file progress: {}", e),
            }
        }

        Ok(Some(BatchProgress::aggregate(
            parsed.job_id,
            status,
            parsed.total_files,
            file_progress,
            seq,
        )))
    }

    /// Remove a job's progress record.
    pub async fn delete(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(vec![keys::progress(job_id), keys::progress_files(job_id)])
            .await?;
        Ok(())
    }

    /// Publish an event on the job's channel.
    pub async fn publish(&self, job_id: &JobId, event: &StreamEvent) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let channel = keys::progress_channel(job_id);
        let payload = serde_json::to_string(&ProgressMessage {
            job_id: job_id.clone(),
            event: event.clone(),
        })?;

        debug!("Publishing {} event to {}", event.event_name(), channel);
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    /// Subscribe to progress events for a job.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(&self, job_id: &JobId) -> StoreResult<ProgressStream> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel = keys::progress_channel(job_id);

        pubsub.subscribe(&channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        });

        Ok(Box::pin(stream))
    }
}
