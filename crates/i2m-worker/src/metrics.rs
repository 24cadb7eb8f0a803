//! Worker metrics.

use metrics::{counter, gauge, histogram};

pub mod names {
    pub const JOBS_FINISHED_TOTAL: &str = "i2m_jobs_finished_total";
    pub const JOBS_RETRIED_TOTAL: &str = "i2m_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "i2m_jobs_dead_lettered_total";
    pub const JOBS_IN_FLIGHT: &str = "i2m_jobs_in_flight";
    pub const JOB_DURATION_SECONDS: &str = "i2m_job_duration_seconds";
    pub const FILES_PROCESSED_TOTAL: &str = "i2m_files_processed_total";
    pub const FILE_DURATION_SECONDS: &str = "i2m_file_duration_seconds";
}

pub fn record_job_started() {
    gauge!(names::JOBS_IN_FLIGHT).increment(1.0);
}

/// Record a job that reached a terminal status.
pub fn record_job_finished(status: &'static str, duration_secs: f64) {
    gauge!(names::JOBS_IN_FLIGHT).decrement(1.0);
    counter!(names::JOBS_FINISHED_TOTAL, "status" => status).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, "status" => status).record(duration_secs);
}

/// Record a job attempt that ended without a terminal status.
pub fn record_job_aborted() {
    gauge!(names::JOBS_IN_FLIGHT).decrement(1.0);
}

pub fn record_job_retried() {
    counter!(names::JOBS_RETRIED_TOTAL).increment(1);
}

pub fn record_job_dead_lettered() {
    counter!(names::JOBS_DEAD_LETTERED_TOTAL).increment(1);
}

pub fn record_file_processed(success: bool, duration_secs: f64) {
    let status = if success { "completed" } else { "failed" };
    counter!(names::FILES_PROCESSED_TOTAL, "status" => status).increment(1);
    histogram!(names::FILE_DURATION_SECONDS, "status" => status).record(duration_secs);
}
