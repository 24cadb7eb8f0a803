//! Client for the FAL.AI queue API.
//!
//! Submits images to the Tripo3D image-to-3D model, polls the request
//! until it finishes and fetches the generated model.

pub mod client;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod retry;
pub mod types;

pub use client::{FalClient, FalClientConfig};
pub use error::{FalError, FalResult};
pub use generator::ModelGenerator;
pub use retry::RetryConfig;
pub use types::{
    FalFile, GeneratedModel, GenerationUpdate, ImageInput, QueueState, QueueStatus,
    SubmitResponse, TripoRequest, TripoResult,
};
