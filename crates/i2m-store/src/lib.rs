//! Redis-backed job tracking.
//!
//! This crate provides:
//! - Job records, ownership and result storage with TTL expiry
//! - Browser sessions
//! - Per-file progress with atomic updates and batch aggregation
//! - Progress events via Redis Pub/Sub
//! - Task enqueueing and consumption via Redis Streams

pub mod error;
pub mod job;
pub mod job_store;
pub mod keys;
pub mod progress;
pub mod queue;
pub mod session;

pub use error::{StoreError, StoreResult};
pub use job::{GenerateModelsJob, JobFile};
pub use job_store::{JobStore, OwnerCheck};
pub use keys::{
    HEARTBEAT_TTL_SECS, JOB_TTL_SECS, PROGRESS_TTL_SECS, SESSION_TTL_SECS,
    STALE_GRACE_PERIOD_SECS, STALE_THRESHOLD_SECS,
};
pub use progress::{ProgressMessage, ProgressStore};
pub use queue::{QueueConfig, TaskQueue};
pub use session::SessionStore;
