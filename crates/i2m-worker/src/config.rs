//! Worker configuration.

use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Maximum files generated in parallel within a single job
    pub max_concurrent_files: usize,
    /// Interval for refreshing the job heartbeat while processing
    pub heartbeat_interval: Duration,
    /// How often the worker scans for orphaned pending tasks
    pub claim_interval: Duration,
    /// Minimum idle time before a pending task can be claimed (crash recovery)
    pub claim_idle_ms: u64,
    /// How long a queue read blocks waiting for new tasks
    pub consume_block_ms: u64,
    /// Graceful shutdown drain timeout
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_concurrent_files: 3,
            heartbeat_interval: Duration::from_secs(15),
            claim_interval: Duration::from_secs(30),
            claim_idle_ms: 300_000, // 5 minutes
            consume_block_ms: 1000,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            max_concurrent_files: std::env::var("MAX_CONCURRENT_FILES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_files),
            heartbeat_interval: std::env::var("HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            claim_interval: std::env::var("CLAIM_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_idle_ms: std::env::var("CLAIM_IDLE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.claim_idle_ms),
            consume_block_ms: defaults.consume_block_ms,
            shutdown_timeout: std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.max_concurrent_files, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.claim_idle_ms, 300_000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }
}
