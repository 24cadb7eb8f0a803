//! Background services and shared helpers.

pub mod stale_job_detector;
pub mod stream_tracker;

pub use stale_job_detector::StaleJobDetector;
pub use stream_tracker::{StreamSlot, StreamTracker};
