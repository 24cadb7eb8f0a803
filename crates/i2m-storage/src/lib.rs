//! Local filesystem storage.
//!
//! This crate provides:
//! - Upload storage for incoming images (one directory per job)
//! - Output storage for generated model files
//! - Listing, deletion and age-based cleanup

pub mod client;
pub mod error;

pub use client::{FileStorage, StorageConfig, StoredFile};
pub use error::{StorageError, StorageResult};
