//! Batch processing.
//!
//! A job runs every file of its batch through the model generator with
//! bounded concurrency. File state changes travel over a channel to a single
//! forwarder task, which writes them to the progress store and publishes the
//! matching stream events, so sequence numbers follow the order of writes.
//!
//! A redelivered job resumes from its stored per-file progress: files that
//! already finished keep their result and are not generated again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use i2m_fal_client::{FalError, FalFile, GenerationUpdate, ImageInput, ModelGenerator};
use i2m_models::{
    BatchProgress, FileId, FileProgress, FileResult, FileStatus, GenerationOptions, JobId,
    JobResults, JobStatus, ResultStatus, StreamEvent,
};
use i2m_storage::{FileStorage, StoredFile};
use i2m_store::{GenerateModelsJob, JobFile, JobStore, ProgressStore, StoreError};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async, FailureTracker, RetryConfig};

const MODEL_EXTENSIONS: &[&str] = &["glb", "gltf", "obj", "usdz", "fbx"];

/// One file state change, as sent to the progress forwarder.
#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub progress: FileProgress,
    /// API path of the stored model, once written
    pub download_url: Option<String>,
}

/// How a job attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished {
        status: JobStatus,
        completed: u32,
        failed: u32,
    },
    /// The job was already terminal when delivered.
    Skipped,
}

/// API path serving a stored model.
pub fn download_url(job_id: &JobId, model_filename: &str) -> String {
    format!("/api/v1/download/{}/{}", job_id, model_filename)
}

/// Extension for a generated model, from its name or MIME type. Defaults to `glb`.
pub fn model_extension(file: &FalFile) -> &'static str {
    let from_name = file
        .file_name
        .as_deref()
        .or_else(|| file.url.rsplit('/').next())
        .and_then(|name| name.split('?').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .and_then(|ext| MODEL_EXTENSIONS.iter().find(|known| **known == ext).copied());

    if let Some(ext) = from_name {
        return ext;
    }

    match file.content_type.as_deref() {
        Some("model/gltf+json") => "gltf",
        Some("model/obj") => "obj",
        Some("model/vnd.usdz+zip") => "usdz",
        _ => "glb",
    }
}

/// Where a file's generation picks up when its job is delivered.
#[derive(Debug, Clone)]
pub enum FileStart {
    /// Finished by an earlier attempt, with the result it produced
    Done(FileResult),
    /// Generate, continuing from the stored progress if there is any
    Run(Option<FileProgress>),
}

/// How a file resumes, from its stored progress and the models already written.
pub fn resume_point(
    job_id: &JobId,
    file: &JobFile,
    stored: Option<&FileProgress>,
    models: &[StoredFile],
) -> FileStart {
    let Some(stored) = stored else {
        return FileStart::Run(None);
    };

    match stored.status {
        FileStatus::Pending => FileStart::Run(None),
        FileStatus::Completed => {
            let prefix = format!("{}.", file.file_id);
            match models.iter().find(|m| m.name.starts_with(&prefix)) {
                Some(model) => FileStart::Done(FileResult {
                    file_id: file.file_id.clone(),
                    filename: file.filename.clone(),
                    status: ResultStatus::Completed,
                    model_url: stored.model_url.clone(),
                    download_url: Some(download_url(job_id, &model.name)),
                    model_filename: Some(model.name.clone()),
                    rendered_image_url: None,
                    content_type: None,
                    size_bytes: Some(model.size_bytes),
                    error: None,
                }),
                None => FileStart::Done(FileResult::failed(
                    file.file_id.clone(),
                    file.filename.clone(),
                    "Stored model is missing",
                )),
            }
        }
        FileStatus::Failed => FileStart::Done(FileResult::failed(
            file.file_id.clone(),
            file.filename.clone(),
            stored
                .error
                .clone()
                .unwrap_or_else(|| "Generation failed".to_string()),
        )),
        FileStatus::Uploading | FileStatus::Queued | FileStatus::Processing => {
            FileStart::Run(Some(stored.clone()))
        }
    }
}

/// Map a generator state change onto the file's progress.
fn apply_generation_update(current: &FileProgress, update: &GenerationUpdate) -> FileProgress {
    match update {
        GenerationUpdate::Submitted { .. } => current
            .with_status(FileStatus::Queued, 15)
            .with_message("Submitted to generator"),
        GenerationUpdate::Queued { position } => current
            .with_status(FileStatus::Queued, 20)
            .with_message("Waiting in generator queue")
            .with_queue_position(*position),
        GenerationUpdate::InProgress { polls, log } => {
            let progress = 30u32.saturating_add(polls.saturating_mul(5)).min(90) as u8;
            current
                .with_status(FileStatus::Processing, progress)
                .with_message(log.clone().unwrap_or_else(|| "Generating 3D model".to_string()))
                .with_queue_position(None)
        }
        GenerationUpdate::Completed => current
            .with_status(FileStatus::Processing, 92)
            .with_message("Downloading model")
            .with_queue_position(None),
    }
}

fn send(updates: &UnboundedSender<FileUpdate>, progress: &FileProgress) {
    updates
        .send(FileUpdate {
            progress: progress.clone(),
            download_url: None,
        })
        .ok();
}

/// Generate, download and store the model of one file.
///
/// Progress continues from `previous` when given, so a resumed file never
/// reports less than it already had. Never fails: any error becomes a failed
/// [`FileResult`] and a failed progress update.
pub async fn generate_file(
    generator: &dyn ModelGenerator,
    storage: &FileStorage,
    job_id: &JobId,
    file: &JobFile,
    previous: Option<FileProgress>,
    options: &GenerationOptions,
    updates: &UnboundedSender<FileUpdate>,
) -> FileResult {
    let started = Instant::now();
    let mut current = previous
        .unwrap_or_else(|| FileProgress::pending(file.file_id.clone(), file.filename.clone()))
        .with_status(FileStatus::Processing, 5)
        .with_message("Reading image")
        .with_queue_position(None);
    send(updates, &current);

    let result = run_file(generator, storage, job_id, file, options, updates, &mut current).await;
    metrics::record_file_processed(result.is_ok(), started.elapsed().as_secs_f64());

    match result {
        Ok((result, download_url)) => {
            let mut done = current
                .with_status(FileStatus::Completed, 100)
                .with_message("Model ready");
            if let Some(url) = &result.model_url {
                done = done.with_model_url(url.clone());
            }
            updates
                .send(FileUpdate {
                    progress: done,
                    download_url: Some(download_url),
                })
                .ok();
            result
        }
        Err(e) => {
            warn!(job_id = %job_id, file_id = %file.file_id, "File generation failed: {}", e);
            let error = e.to_string();
            send(
                updates,
                &current
                    .with_status(FileStatus::Failed, 100)
                    .with_message("Generation failed")
                    .with_error(error.clone()),
            );
            FileResult::failed(file.file_id.clone(), file.filename.clone(), error)
        }
    }
}

async fn run_file(
    generator: &dyn ModelGenerator,
    storage: &FileStorage,
    job_id: &JobId,
    file: &JobFile,
    options: &GenerationOptions,
    updates: &UnboundedSender<FileUpdate>,
    current: &mut FileProgress,
) -> WorkerResult<(FileResult, String)> {
    let bytes = storage.read_upload(job_id, &file.stored_name).await?;
    let image = ImageInput::new(bytes, file.content_type.clone());

    let (tx, mut rx) = unbounded_channel::<GenerationUpdate>();
    let relay = async {
        while let Some(update) = rx.recv().await {
            *current = apply_generation_update(current, &update);
            send(updates, current);
        }
    };
    let (generated, ()) = tokio::join!(generator.generate(image, options.clone(), tx), relay);
    let generated = generated?;

    let download_config = RetryConfig::new("model_download");
    let model_bytes = retry_async(&download_config, FalError::is_retryable, || {
        generator.download(&generated.model.url)
    })
    .await?;

    if model_bytes.is_empty() {
        return Err(WorkerError::processing_failed("Generator returned an empty model"));
    }

    let model_filename = format!("{}.{}", file.file_id, model_extension(&generated.model));
    storage.write_model(job_id, &model_filename, &model_bytes).await?;
    let download_url = download_url(job_id, &model_filename);

    let result = FileResult {
        file_id: file.file_id.clone(),
        filename: file.filename.clone(),
        status: ResultStatus::Completed,
        model_url: Some(generated.model.url.clone()),
        download_url: Some(download_url.clone()),
        model_filename: Some(model_filename),
        rendered_image_url: generated.rendered_image.as_ref().map(|f| f.url.clone()),
        content_type: generated.model.content_type.clone(),
        size_bytes: Some(model_bytes.len() as u64),
        error: None,
    };

    Ok((result, download_url))
}

/// Background task tied to a job attempt; aborted when dropped.
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn spawn<F>(task: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(task))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs generation jobs end to end against Redis and local storage.
pub struct BatchProcessor {
    config: WorkerConfig,
    jobs: JobStore,
    progress: ProgressStore,
    storage: FileStorage,
    generator: Arc<dyn ModelGenerator>,
}

impl BatchProcessor {
    pub fn new(
        config: WorkerConfig,
        jobs: JobStore,
        progress: ProgressStore,
        storage: FileStorage,
        generator: Arc<dyn ModelGenerator>,
    ) -> Self {
        Self {
            config,
            jobs,
            progress,
            storage,
            generator,
        }
    }

    /// Process one queued job.
    pub async fn process(&self, task: &GenerateModelsJob) -> WorkerResult<JobOutcome> {
        let logger = JobLogger::new(&task.job_id, "generate_models");
        let span = logger.create_span();
        self.process_inner(task, &logger).instrument(span).await
    }

    async fn process_inner(
        &self,
        task: &GenerateModelsJob,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        let job_id = &task.job_id;
        let started = Instant::now();

        let job = self.jobs.require_job(job_id).await?;
        let starts = match job.status {
            status if status.is_terminal() => {
                logger.log_warning(&format!("Job already {}, skipping", status));
                return Ok(JobOutcome::Skipped);
            }
            JobStatus::Pending => {
                self.jobs
                    .update_status(job_id, JobStatus::Processing, None)
                    .await?;
                self.progress.set_status(job_id, JobStatus::Processing).await?;
                vec![FileStart::Run(None); task.files.len()]
            }
            _ => {
                let starts = self.resume_points(task).await?;
                let finished = starts
                    .iter()
                    .filter(|start| matches!(start, FileStart::Done(_)))
                    .count();
                logger.log_warning(&format!(
                    "Job redelivered while processing, {} of {} file(s) already finished",
                    finished,
                    task.files.len()
                ));
                starts
            }
        };

        logger.log_start(&format!("{} file(s)", task.files.len()));

        self.jobs.mark_active(job_id).await?;
        self.jobs.record_heartbeat(job_id).await?;
        let _heartbeat = self.spawn_heartbeat(job_id.clone());
        metrics::record_job_started();

        let results = match self.run_files(task, starts, logger).await {
            Ok(results) => results,
            Err(e) => {
                logger.log_error(&e.to_string());
                metrics::record_job_aborted();
                return Err(e);
            }
        };

        match self.finalize(task, results, logger).await {
            Ok(outcome) => {
                match outcome {
                    JobOutcome::Finished { status, .. } => metrics::record_job_finished(
                        status.as_str(),
                        started.elapsed().as_secs_f64(),
                    ),
                    JobOutcome::Skipped => metrics::record_job_aborted(),
                }
                Ok(outcome)
            }
            Err(e) => {
                logger.log_error(&e.to_string());
                metrics::record_job_aborted();
                Err(e)
            }
        }
    }

    /// Resume points of every file, from the stored progress and models.
    async fn resume_points(&self, task: &GenerateModelsJob) -> WorkerResult<Vec<FileStart>> {
        let stored: HashMap<FileId, FileProgress> = self
            .progress
            .snapshot(&task.job_id)
            .await?
            .map(|snapshot| {
                snapshot
                    .files
                    .into_iter()
                    .map(|file| (file.file_id.clone(), file))
                    .collect()
            })
            .unwrap_or_default();
        let models = self.storage.list_models(&task.job_id).await?;

        Ok(task
            .files
            .iter()
            .map(|file| resume_point(&task.job_id, file, stored.get(&file.file_id), &models))
            .collect())
    }

    /// Whether another worker is still processing the job.
    pub async fn has_live_worker(&self, job_id: &JobId) -> WorkerResult<bool> {
        Ok(self.jobs.has_live_worker(job_id).await?)
    }

    fn spawn_heartbeat(&self, job_id: JobId) -> TaskGuard {
        let jobs = self.jobs.clone();
        let interval = self.config.heartbeat_interval;

        TaskGuard::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut failures = FailureTracker::new(3);
            loop {
                ticker.tick().await;
                match jobs.record_heartbeat(&job_id).await {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            warn!(job_id = %job_id, "Failed to refresh heartbeat: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn run_files(
        &self,
        task: &GenerateModelsJob,
        starts: Vec<FileStart>,
        logger: &JobLogger,
    ) -> WorkerResult<Vec<FileResult>> {
        let known = task
            .files
            .iter()
            .zip(&starts)
            .filter_map(|(file, start)| match start {
                FileStart::Done(result) => {
                    let status = if result.is_success() {
                        FileStatus::Completed
                    } else {
                        FileStatus::Failed
                    };
                    Some(
                        FileProgress::pending(file.file_id.clone(), file.filename.clone())
                            .with_status(status, 100),
                    )
                }
                FileStart::Run(previous) => previous.clone(),
            })
            .collect();

        let (updates, receiver) = unbounded_channel();
        let forwarder = tokio::spawn(forward_progress(
            self.progress.clone(),
            task.job_id.clone(),
            task.files.len() as u32,
            known,
            receiver,
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_files));
        let generator = self.generator.as_ref();

        let runs = task.files.iter().zip(starts).map(|(file, start)| {
            let semaphore = Arc::clone(&semaphore);
            let updates = updates.clone();
            async move {
                let previous = match start {
                    FileStart::Done(result) => {
                        logger.log_file(&file.file_id, "Finished by an earlier attempt");
                        return result;
                    }
                    FileStart::Run(previous) => previous,
                };

                let _permit = semaphore.acquire_owned().await.ok();
                logger.log_file(&file.file_id, "Generating model");
                let result = generate_file(
                    generator,
                    &self.storage,
                    &task.job_id,
                    file,
                    previous,
                    &task.options,
                    &updates,
                )
                .await;
                let outcome = if result.is_success() { "Model stored" } else { "Failed" };
                logger.log_file(&file.file_id, outcome);
                result
            }
        });
        let results = join_all(runs).await;

        drop(updates);
        match forwarder.await {
            Ok(()) => {}
            Err(e) => warn!(job_id = %task.job_id, "Progress forwarder stopped: {}", e),
        }

        Ok(results)
    }

    async fn finalize(
        &self,
        task: &GenerateModelsJob,
        files: Vec<FileResult>,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        let job_id = &task.job_id;
        let results = JobResults::new(job_id.clone(), files);
        let completed = results.success_count();
        let failed = results.failure_count();

        let store_config = RetryConfig::new("store_results");
        retry_async(&store_config, is_transient, || self.jobs.store_results(&results)).await?;

        let mut job = self.jobs.require_job(job_id).await?;
        if job.status.is_terminal() {
            logger.log_warning(&format!(
                "Job became {} while processing, keeping that status",
                job.status
            ));
            self.jobs.mark_inactive(job_id).await?;
            return Ok(JobOutcome::Skipped);
        }

        job.completed_files = completed;
        job.failed_files = failed;
        let status = job.final_status();
        let event = if status == JobStatus::Completed {
            job.transition(JobStatus::Completed).map_err(StoreError::from)?;
            StreamEvent::task_completed(job_id.clone(), job.total_files, completed, failed)
        } else {
            let message = format!("All {} file(s) failed to generate", job.total_files);
            job.fail(message.clone()).map_err(StoreError::from)?;
            StreamEvent::task_failed(job_id.clone(), message)
        };
        self.jobs.save_job(&job).await?;

        let seq = self.progress.set_status(job_id, status).await?;
        if let Err(e) = self.progress.publish(job_id, &event.with_seq(seq)).await {
            warn!(job_id = %job_id, "Failed to publish final event: {}", e);
        }

        self.jobs.mark_inactive(job_id).await?;

        logger.log_completion(&format!(
            "{}: {} completed, {} failed",
            status, completed, failed
        ));

        Ok(JobOutcome::Finished {
            status,
            completed,
            failed,
        })
    }

    /// Fail a job that will not be retried and tell any open streams.
    pub async fn fail_job(&self, job_id: &JobId, message: &str) -> WorkerResult<()> {
        match self
            .jobs
            .update_status(job_id, JobStatus::Failed, Some(message.to_string()))
            .await
        {
            Ok(_) => {}
            // Already terminal or expired; nothing left to report
            Err(StoreError::InvalidState(_)) | Err(StoreError::JobNotFound(_)) => {
                debug!(job_id = %job_id, "Job not failed, already terminal or expired");
                self.jobs.mark_inactive(job_id).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let seq = self.progress.set_status(job_id, JobStatus::Failed).await?;
        let event = StreamEvent::task_failed(job_id.clone(), message).with_seq(seq);
        if let Err(e) = self.progress.publish(job_id, &event).await {
            warn!(job_id = %job_id, "Failed to publish failure event: {}", e);
        }
        self.jobs.mark_inactive(job_id).await?;
        Ok(())
    }
}

fn is_transient(e: &StoreError) -> bool {
    matches!(e, StoreError::ConnectionFailed(_) | StoreError::Redis(_))
}

/// Stream event for one file update.
pub fn file_event(
    job_id: &JobId,
    update: &FileUpdate,
    overall_progress: u8,
    seq: u64,
) -> StreamEvent {
    let file = &update.progress;
    match file.status {
        FileStatus::Completed => StreamEvent::FileCompleted {
            seq,
            job_id: job_id.clone(),
            file_id: file.file_id.clone(),
            filename: file.filename.clone(),
            download_url: update.download_url.clone(),
            model_url: file.model_url.clone(),
        },
        FileStatus::Failed => StreamEvent::FileFailed {
            seq,
            job_id: job_id.clone(),
            file_id: file.file_id.clone(),
            filename: file.filename.clone(),
            error: file.error.clone().unwrap_or_else(|| "Generation failed".to_string()),
        },
        _ => StreamEvent::FileProgress {
            seq,
            job_id: job_id.clone(),
            file: file.clone(),
            overall_progress,
        },
    }
}

/// Tracks the latest state of every file to compute the overall percentage.
#[derive(Debug, Default)]
pub struct OverallProgress {
    total: u32,
    files: HashMap<FileId, FileProgress>,
}

impl OverallProgress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            files: HashMap::new(),
        }
    }

    /// Record a file update and return the overall percentage.
    pub fn update(&mut self, job_id: &JobId, file: &FileProgress) -> u8 {
        self.files.insert(file.file_id.clone(), file.clone());
        BatchProgress::aggregate(
            job_id.clone(),
            JobStatus::Processing,
            self.total,
            self.files.values().cloned().collect(),
            0,
        )
        .progress
    }
}

async fn forward_progress(
    progress: ProgressStore,
    job_id: JobId,
    total_files: u32,
    known: Vec<FileProgress>,
    mut receiver: UnboundedReceiver<FileUpdate>,
) {
    let mut overall = OverallProgress::new(total_files);
    for file in &known {
        overall.update(&job_id, file);
    }

    while let Some(update) = receiver.recv().await {
        let percent = overall.update(&job_id, &update.progress);

        let seq = match progress.update_file(&job_id, &update.progress).await {
            Ok(seq) => seq,
            Err(e) => {
                warn!(job_id = %job_id, file_id = %update.progress.file_id, "Failed to store file progress: {}", e);
                continue;
            }
        };

        let event = file_event(&job_id, &update, percent, seq);
        if let Err(e) = progress.publish(&job_id, &event).await {
            debug!(job_id = %job_id, "Failed to publish file event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use i2m_fal_client::{FalResult, GeneratedModel};
    use i2m_storage::StorageConfig;
    use mockall::mock;
    use tempfile::TempDir;

    mock! {
        pub Generator {}

        #[async_trait]
        impl ModelGenerator for Generator {
            async fn generate(
                &self,
                image: ImageInput,
                options: GenerationOptions,
                updates: UnboundedSender<GenerationUpdate>,
            ) -> FalResult<GeneratedModel>;

            async fn download(&self, url: &str) -> FalResult<Vec<u8>>;
        }
    }

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];

    fn fal_file(url: &str) -> FalFile {
        FalFile {
            url: url.to_string(),
            content_type: Some("model/gltf-binary".to_string()),
            file_name: None,
            file_size: None,
        }
    }

    async fn storage_with_upload(job_id: &JobId, file: &JobFile) -> (FileStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(StorageConfig {
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("results"),
        });
        storage.init().await.unwrap();
        storage
            .save_upload(job_id, &file.stored_name, PNG)
            .await
            .unwrap();
        (storage, dir)
    }

    fn job_file() -> JobFile {
        let file_id = FileId::new();
        JobFile {
            stored_name: format!("{}.png", file_id),
            file_id,
            filename: "chair.png".to_string(),
            content_type: "image/png".to_string(),
        }
    }

    fn drain(mut rx: UnboundedReceiver<FileUpdate>) -> Vec<FileUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[tokio::test]
    async fn test_generate_file_success() {
        let job_id = JobId::new();
        let file = job_file();
        let (storage, _dir) = storage_with_upload(&job_id, &file).await;

        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .withf(|image, _, _| image.content_type == "image/png" && image.bytes == PNG)
            .times(1)
            .returning(|_, _, updates| {
                updates
                    .send(GenerationUpdate::Submitted {
                        request_id: "req-1".to_string(),
                    })
                    .ok();
                updates
                    .send(GenerationUpdate::Queued { position: Some(2) })
                    .ok();
                updates
                    .send(GenerationUpdate::InProgress { polls: 3, log: None })
                    .ok();
                updates.send(GenerationUpdate::Completed).ok();
                Ok(GeneratedModel {
                    request_id: "req-1".to_string(),
                    model: fal_file("https://fal.example/files/model.glb"),
                    rendered_image: Some(fal_file("https://fal.example/files/preview.webp")),
                })
            });
        generator
            .expect_download()
            .withf(|url| url.ends_with("/files/model.glb"))
            .times(1)
            .returning(|_| Ok(b"glTF-binary-model".to_vec()));

        let (tx, rx) = unbounded_channel();
        let result = generate_file(
            &generator,
            &storage,
            &job_id,
            &file,
            None,
            &GenerationOptions::default(),
            &tx,
        )
        .await;

        assert_eq!(result.status, ResultStatus::Completed);
        let model_filename = format!("{}.glb", file.file_id);
        assert_eq!(result.model_filename.as_deref(), Some(model_filename.as_str()));
        assert_eq!(
            result.download_url,
            Some(download_url(&job_id, &model_filename))
        );
        assert_eq!(result.size_bytes, Some(17));
        assert_eq!(
            result.rendered_image_url.as_deref(),
            Some("https://fal.example/files/preview.webp")
        );

        let stored = storage.list_models(&job_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, model_filename);

        drop(tx);
        let updates = drain(rx);
        let statuses: Vec<FileStatus> = updates.iter().map(|u| u.progress.status).collect();
        assert_eq!(
            statuses,
            vec![
                FileStatus::Processing,
                FileStatus::Queued,
                FileStatus::Queued,
                FileStatus::Processing,
                FileStatus::Processing,
                FileStatus::Completed,
            ]
        );
        assert_eq!(updates[2].progress.queue_position, Some(2));

        // Progress never moves backwards
        let percents: Vec<u8> = updates.iter().map(|u| u.progress.progress).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);

        let last = updates.last().unwrap();
        assert_eq!(last.progress.progress, 100);
        assert_eq!(last.download_url, result.download_url);
    }

    #[tokio::test]
    async fn test_generate_file_generator_error() {
        let job_id = JobId::new();
        let file = job_file();
        let (storage, _dir) = storage_with_upload(&job_id, &file).await;

        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .times(1)
            .returning(|_, _, _| Err(FalError::generation_failed("mesh could not be built")));
        generator.expect_download().never();

        let (tx, rx) = unbounded_channel();
        let result = generate_file(
            &generator,
            &storage,
            &job_id,
            &file,
            None,
            &GenerationOptions::default(),
            &tx,
        )
        .await;

        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.error.unwrap().contains("mesh could not be built"));
        assert!(storage.list_models(&job_id).await.unwrap().is_empty());

        drop(tx);
        let last = drain(rx).pop().unwrap();
        assert_eq!(last.progress.status, FileStatus::Failed);
        assert!(last.progress.error.is_some());
    }

    #[tokio::test]
    async fn test_generate_file_missing_upload() {
        let job_id = JobId::new();
        let file = job_file();
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(StorageConfig {
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("results"),
        });

        let mut generator = MockGenerator::new();
        generator.expect_generate().never();

        let (tx, _rx) = unbounded_channel();
        let result = generate_file(
            &generator,
            &storage,
            &job_id,
            &file,
            None,
            &GenerationOptions::default(),
            &tx,
        )
        .await;

        assert_eq!(result.status, ResultStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_model_fails_file() {
        let job_id = JobId::new();
        let file = job_file();
        let (storage, _dir) = storage_with_upload(&job_id, &file).await;

        let mut generator = MockGenerator::new();
        generator.expect_generate().returning(|_, _, _| {
            Ok(GeneratedModel {
                request_id: "req-2".to_string(),
                model: fal_file("https://fal.example/files/model.glb"),
                rendered_image: None,
            })
        });
        generator.expect_download().returning(|_| Ok(Vec::new()));

        let (tx, _rx) = unbounded_channel();
        let result = generate_file(
            &generator,
            &storage,
            &job_id,
            &file,
            None,
            &GenerationOptions::default(),
            &tx,
        )
        .await;

        assert_eq!(result.status, ResultStatus::Failed);
    }

    #[tokio::test]
    async fn test_generate_file_continues_from_previous_progress() {
        let job_id = JobId::new();
        let file = job_file();
        let (storage, _dir) = storage_with_upload(&job_id, &file).await;

        let mut generator = MockGenerator::new();
        generator.expect_generate().times(1).returning(|_, _, updates| {
            updates
                .send(GenerationUpdate::Queued { position: Some(1) })
                .ok();
            Ok(GeneratedModel {
                request_id: "req-3".to_string(),
                model: fal_file("https://fal.example/files/model.glb"),
                rendered_image: None,
            })
        });
        generator
            .expect_download()
            .returning(|_| Ok(b"glb".to_vec()));

        let previous = FileProgress::pending(file.file_id.clone(), file.filename.clone())
            .with_status(FileStatus::Processing, 60)
            .with_queue_position(Some(4));

        let (tx, rx) = unbounded_channel();
        let result = generate_file(
            &generator,
            &storage,
            &job_id,
            &file,
            Some(previous),
            &GenerationOptions::default(),
            &tx,
        )
        .await;
        assert!(result.is_success());

        drop(tx);
        let updates = drain(rx);
        assert_eq!(updates[0].progress.status, FileStatus::Processing);
        assert_eq!(updates[0].progress.queue_position, None);
        assert!(updates.iter().all(|u| u.progress.progress >= 60));
    }

    fn stored_model(name: &str) -> StoredFile {
        StoredFile {
            name: name.to_string(),
            size_bytes: 2048,
            modified_at: None,
        }
    }

    #[test]
    fn test_resume_point_keeps_finished_files() {
        let job_id = JobId::new();
        let file = job_file();
        let stored = FileProgress::pending(file.file_id.clone(), file.filename.clone())
            .with_status(FileStatus::Completed, 100)
            .with_model_url("https://fal.example/files/model.glb");
        let models = vec![
            stored_model("other.glb"),
            stored_model(&format!("{}.glb", file.file_id)),
        ];

        match resume_point(&job_id, &file, Some(&stored), &models) {
            FileStart::Done(result) => {
                let model_filename = format!("{}.glb", file.file_id);
                assert_eq!(result.status, ResultStatus::Completed);
                assert_eq!(result.model_filename.as_deref(), Some(model_filename.as_str()));
                assert_eq!(result.download_url, Some(download_url(&job_id, &model_filename)));
                assert_eq!(result.size_bytes, Some(2048));
                assert_eq!(
                    result.model_url.as_deref(),
                    Some("https://fal.example/files/model.glb")
                );
            }
            other => panic!("unexpected start {:?}", other),
        }

        // Completed but the model was removed since
        match resume_point(&job_id, &file, Some(&stored), &[]) {
            FileStart::Done(result) => assert_eq!(result.status, ResultStatus::Failed),
            other => panic!("unexpected start {:?}", other),
        }

        let failed = FileProgress::pending(file.file_id.clone(), file.filename.clone())
            .with_status(FileStatus::Failed, 100)
            .with_error("mesh could not be built");
        match resume_point(&job_id, &file, Some(&failed), &models) {
            FileStart::Done(result) => {
                assert_eq!(result.status, ResultStatus::Failed);
                assert_eq!(result.error.as_deref(), Some("mesh could not be built"));
            }
            other => panic!("unexpected start {:?}", other),
        }
    }

    #[test]
    fn test_resume_point_reruns_unfinished_files() {
        let job_id = JobId::new();
        let file = job_file();

        assert!(matches!(
            resume_point(&job_id, &file, None, &[]),
            FileStart::Run(None)
        ));

        let pending = FileProgress::pending(file.file_id.clone(), file.filename.clone());
        assert!(matches!(
            resume_point(&job_id, &file, Some(&pending), &[]),
            FileStart::Run(None)
        ));

        let running = pending.with_status(FileStatus::Processing, 45);
        match resume_point(&job_id, &file, Some(&running), &[]) {
            FileStart::Run(Some(previous)) => assert_eq!(previous.progress, 45),
            other => panic!("unexpected start {:?}", other),
        }
    }

    #[test]
    fn test_model_extension() {
        assert_eq!(model_extension(&fal_file("https://x/a/model.glb")), "glb");
        assert_eq!(model_extension(&fal_file("https://x/a/model.OBJ?sig=1")), "obj");

        let mut file = fal_file("https://x/a/blob");
        file.content_type = Some("model/gltf+json".to_string());
        assert_eq!(model_extension(&file), "gltf");

        file.content_type = None;
        assert_eq!(model_extension(&file), "glb");

        file.file_name = Some("scene.usdz".to_string());
        assert_eq!(model_extension(&file), "usdz");
    }

    #[test]
    fn test_overall_progress() {
        let job_id = JobId::new();
        let a = FileProgress::pending(FileId::new(), "a.png");
        let b = FileProgress::pending(FileId::new(), "b.png");
        let mut overall = OverallProgress::new(2);

        assert_eq!(overall.update(&job_id, &a.with_status(FileStatus::Processing, 50)), 25);
        assert_eq!(overall.update(&job_id, &b.with_status(FileStatus::Failed, 0)), 75);
        assert_eq!(overall.update(&job_id, &a.with_status(FileStatus::Completed, 100)), 100);
    }

    #[test]
    fn test_file_event_kinds() {
        let job_id = JobId::new();
        let file = FileProgress::pending(FileId::new(), "a.png");

        let progress = FileUpdate {
            progress: file.with_status(FileStatus::Processing, 40),
            download_url: None,
        };
        assert!(matches!(
            file_event(&job_id, &progress, 40, 3),
            StreamEvent::FileProgress { seq: 3, overall_progress: 40, .. }
        ));

        let done = FileUpdate {
            progress: file.with_status(FileStatus::Completed, 100),
            download_url: Some("/api/v1/download/x/y.glb".to_string()),
        };
        match file_event(&job_id, &done, 100, 4) {
            StreamEvent::FileCompleted { seq, download_url, .. } => {
                assert_eq!(seq, 4);
                assert_eq!(download_url.as_deref(), Some("/api/v1/download/x/y.glb"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let failed = FileUpdate {
            progress: file.with_status(FileStatus::Failed, 0).with_error("boom"),
            download_url: None,
        };
        assert!(matches!(
            file_event(&job_id, &failed, 100, 5),
            StreamEvent::FileFailed { ref error, .. } if error == "boom"
        ));
    }
}
