//! Background service for detecting and recovering stale jobs.
//!
//! This service runs periodically to:
//! - Detect running jobs whose worker stopped sending heartbeats
//! - Mark them as failed and notify connected streams
//! - Clean up active-set entries for jobs that already finished or expired

use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{error, info, warn};

use i2m_models::{Job, JobStatus, StreamEvent};
use i2m_store::job_store::is_stale;
use i2m_store::{JobStore, ProgressStore};

use crate::metrics;

/// Interval between stale job detection runs.
const DETECTION_INTERVAL: Duration = Duration::from_secs(30);

const STALE_ERROR_MESSAGE: &str =
    "Processing timed out. The worker may have crashed. Please try again.";

/// Stale job detector service.
pub struct StaleJobDetector {
    jobs: JobStore,
    progress: ProgressStore,
    enabled: bool,
}

impl StaleJobDetector {
    /// Create a new stale job detector.
    pub fn new(jobs: JobStore, progress: ProgressStore) -> Self {
        let enabled = std::env::var("ENABLE_STALE_DETECTION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Self {
            jobs,
            progress,
            enabled,
        }
    }

    /// Start the background detection loop.
    ///
    /// Runs until the task is dropped; spawn it.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Stale job detection is disabled");
            return;
        }

        info!("Starting stale job detector (interval: {:?})", DETECTION_INTERVAL);

        let mut ticker = interval(DETECTION_INTERVAL);

        loop {
            ticker.tick().await;

            match self.check_once().await {
                Ok((stale, recovered)) if stale > 0 => {
                    info!(
                        "Stale job detection complete: {} stale, {} recovered",
                        stale, recovered
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Stale job detection error: {}", e),
            }
        }
    }

    /// Run a single detection and recovery cycle.
    ///
    /// Returns `(stale, recovered)` counts.
    pub async fn check_once(&self) -> anyhow::Result<(u32, u32)> {
        let active = self.jobs.active_jobs().await?;
        let mut stale_count = 0u32;
        let mut recovered_count = 0u32;
        let now = Utc::now();

        for job_id in active {
            let Some(job) = self.jobs.get_job(&job_id).await? else {
                // Record expired; nothing left to recover
                self.jobs.mark_inactive(&job_id).await.ok();
                continue;
            };

            if job.status.is_terminal() {
                self.jobs.mark_inactive(&job_id).await.ok();
                continue;
            }

            let last_heartbeat = self.jobs.last_heartbeat(&job_id).await?;
            if !is_stale(&job, last_heartbeat, now) {
                continue;
            }

            stale_count += 1;
            warn!(
                job_id = %job.job_id,
                session_id = ?job.session_id,
                last_heartbeat = ?last_heartbeat,
                started_at = ?job.started_at,
                "Detected stale job (no heartbeat)"
            );

            match self.recover_stale_job(job).await {
                Ok(()) => {
                    recovered_count += 1;
                    metrics::record_stale_job_recovered();
                }
                Err(e) => error!(job_id = %job_id, "Failed to recover stale job: {}", e),
            }
        }

        Ok((stale_count, recovered_count))
    }

    /// Mark a stale job as failed and tell any open streams.
    async fn recover_stale_job(&self, job: Job) -> anyhow::Result<()> {
        let job_id = job.job_id.clone();

        self.jobs
            .update_status(&job_id, JobStatus::Failed, Some(STALE_ERROR_MESSAGE.to_string()))
            .await?;

        let seq = self.progress.set_status(&job_id, JobStatus::Failed).await?;
        let event = StreamEvent::task_failed(job_id.clone(), STALE_ERROR_MESSAGE).with_seq(seq);
        if let Err(e) = self.progress.publish(&job_id, &event).await {
            warn!(job_id = %job_id, "Failed to publish stale job event: {}", e);
        }

        self.jobs.mark_inactive(&job_id).await?;

        info!(job_id = %job_id, "Recovered stale job");
        Ok(())
    }
}
