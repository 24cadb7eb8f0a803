//! Job executor.
//!
//! While a job runs, its stream entry is touched on every heartbeat so other
//! workers only claim it once this worker has gone quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use i2m_store::{GenerateModelsJob, TaskQueue};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::processor::{BatchProcessor, JobOutcome, TaskGuard};
use crate::retry::FailureTracker;

/// What to do with a task whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Leave the message pending so a claim redelivers it.
    Retry,
    /// Move the message to the dead letter queue.
    DeadLetter,
}

/// Decide between redelivery and the DLQ after a failed attempt.
pub fn failure_action(retryable: bool, attempts: u32, max_retries: u32) -> FailureAction {
    if retryable && attempts < max_retries {
        FailureAction::Retry
    } else {
        FailureAction::DeadLetter
    }
}

/// Pulls tasks from the queue and runs them on the batch processor.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    processor: Arc<BatchProcessor>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: TaskQueue, processor: Arc<BatchProcessor>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            queue: Arc::new(queue),
            processor,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`shutdown`](Self::shutdown) is called, then drain in-flight jobs.
    pub async fn run(self: &Arc<Self>) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        self.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = tokio::spawn(Arc::clone(self).claim_loop(self.shutdown.subscribe()));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {:?}, they will be reclaimed",
                self.config.shutdown_timeout
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    async fn claim_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.claim_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let jobs = match self
                        .queue
                        .claim_pending(&self.consumer_name, self.config.claim_idle_ms, 5)
                        .await
                    {
                        Ok(jobs) => jobs,
                        Err(e) => {
                            warn!("Failed to claim pending jobs: {}", e);
                            continue;
                        }
                    };
                    if jobs.is_empty() {
                        continue;
                    }

                    info!("Claimed {} pending jobs", jobs.len());
                    for (message_id, job) in jobs {
                        // The owner missed its touches but still heartbeats; let it finish
                        match self.processor.has_live_worker(&job.job_id).await {
                            Ok(true) => {
                                info!(job_id = %job.job_id, "Claimed job still has a live worker, leaving it");
                                continue;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(job_id = %job.job_id, "Failed to check worker heartbeat: {}", e),
                        }

                        let Ok(permit) = Arc::clone(&self.job_semaphore).acquire_owned().await else {
                            break;
                        };
                        self.spawn_job(permit, message_id, job);
                    }
                }
            }
        }
    }

    async fn consume_jobs(self: &Arc<Self>) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .queue
            .consume(
                &self.consumer_name,
                self.config.consume_block_ms,
                available.min(5),
            )
            .await?;

        if jobs.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", jobs.len());

        for (message_id, job) in jobs {
            let permit = Arc::clone(&self.job_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
            self.spawn_job(permit, message_id, job);
        }

        Ok(())
    }

    fn spawn_job(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        message_id: String,
        job: GenerateModelsJob,
    ) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            executor.execute(&message_id, &job).await;
        });
    }

    /// Keep the stream entry of a running task from going idle.
    fn spawn_lease(&self, message_id: &str) -> TaskGuard {
        let queue = Arc::clone(&self.queue);
        let consumer_name = self.consumer_name.clone();
        let message_id = message_id.to_string();
        let interval = self.config.heartbeat_interval;

        TaskGuard::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut failures = FailureTracker::new(3);
            loop {
                ticker.tick().await;
                match queue.touch(&consumer_name, &message_id).await {
                    Ok(true) => failures.record_success(),
                    Ok(false) => {
                        debug!(message_id = %message_id, "Task no longer pending, lease ends");
                        break;
                    }
                    Err(e) => {
                        if failures.record_failure() {
                            warn!(message_id = %message_id, "Failed to refresh task lease: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Execute one delivered task: process it, then ack it, leave it pending
    /// for another attempt or move it to the DLQ.
    pub async fn execute(&self, message_id: &str, job: &GenerateModelsJob) {
        let job_id = &job.job_id;
        info!(job_id = %job_id, "Executing job");

        let lease = self.spawn_lease(message_id);
        let processed = self.processor.process(job).await;
        drop(lease);

        let error = match processed {
            Ok(outcome) => {
                if let JobOutcome::Finished { status, .. } = outcome {
                    info!(job_id = %job_id, status = %status, "Job finished");
                }
                if let Err(e) = self.queue.ack(message_id).await {
                    error!(job_id = %job_id, "Failed to ack job: {}", e);
                }
                return;
            }
            Err(e) => e,
        };

        error!(job_id = %job_id, "Job attempt failed: {}", error);

        let attempts = match self.queue.increment_retry(message_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(job_id = %job_id, "Failed to count retry: {}", e);
                u32::MAX
            }
        };
        let max_retries = self.queue.max_retries();

        match failure_action(error.is_retryable(), attempts, max_retries) {
            FailureAction::Retry => {
                metrics::record_job_retried();
                info!(
                    job_id = %job_id,
                    "Job will be retried (attempt {}/{})",
                    attempts, max_retries
                );
            }
            FailureAction::DeadLetter => {
                metrics::record_job_dead_lettered();
                warn!(job_id = %job_id, "Job will not be retried, moving to DLQ");
                if let Err(e) = self.queue.dlq(message_id, job, &error.to_string()).await {
                    error!(job_id = %job_id, "Failed to move job to DLQ: {}", e);
                }
                let message = format!("Job failed: {}", error);
                if let Err(e) = self.processor.fail_job(job_id, &message).await {
                    error!(job_id = %job_id, "Failed to mark job as failed: {}", e);
                }
            }
        }
    }

    async fn wait_for_jobs(&self) {
        while self.job_semaphore.available_permits() < self.config.max_concurrent_jobs {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_action() {
        assert_eq!(failure_action(true, 1, 3), FailureAction::Retry);
        assert_eq!(failure_action(true, 2, 3), FailureAction::Retry);
        assert_eq!(failure_action(true, 3, 3), FailureAction::DeadLetter);
        assert_eq!(failure_action(false, 1, 3), FailureAction::DeadLetter);
        assert_eq!(failure_action(true, u32::MAX, 3), FailureAction::DeadLetter);
    }
}
