//! 3D model generation worker.
//!
//! This crate provides:
//! - Job executor reading generation tasks from the Redis stream
//! - Batch processing with bounded per-file concurrency
//! - Progress emission for every file state change
//! - Retry, dead-lettering and graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod retry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{failure_action, FailureAction, JobExecutor};
pub use logging::JobLogger;
pub use processor::{generate_file, resume_point, BatchProcessor, FileStart, FileUpdate, JobOutcome};
