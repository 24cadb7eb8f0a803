//! Shared data models for the image2model backend.
//!
//! This crate provides Serde-serializable types for:
//! - Job, file and session identifiers
//! - The job record and its task state machine
//! - Per-file progress and batch aggregation
//! - Generation results
//! - Server-Sent Event payloads
//! - Tripo3D generation options

pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod options;
pub mod progress;
pub mod result;
pub mod session;
pub mod utils;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use events::{StreamEvent, StreamEventType};
pub use ids::{is_valid_id, FileId, JobId, SessionId};
pub use job::{FileEntry, Job, JobStatus};
pub use options::{GenerationOptions, Orientation, TextureQuality};
pub use progress::{BatchProgress, FileProgress, FileStatus};
pub use result::{FileResult, JobResults, ResultStatus};
pub use session::Session;
pub use utils::{extension_for_content_type, format_bytes, sanitize_filename};
