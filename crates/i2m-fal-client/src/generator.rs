//! Model generation seam used by the worker.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use i2m_models::GenerationOptions;

use crate::client::FalClient;
use crate::error::FalResult;
use crate::types::{GeneratedModel, GenerationUpdate, ImageInput};

/// Turns an image into a 3D model.
#[async_trait]
pub trait ModelGenerator: Send + Sync {
    /// Generate a model, reporting state changes on `updates`.
    async fn generate(
        &self,
        image: ImageInput,
        options: GenerationOptions,
        updates: UnboundedSender<GenerationUpdate>,
    ) -> FalResult<GeneratedModel>;

    /// Fetch a generated file.
    async fn download(&self, url: &str) -> FalResult<Vec<u8>>;
}

#[async_trait]
impl ModelGenerator for FalClient {
    async fn generate(
        &self,
        image: ImageInput,
        options: GenerationOptions,
        updates: UnboundedSender<GenerationUpdate>,
    ) -> FalResult<GeneratedModel> {
        FalClient::generate(self, &image, &options, updates).await
    }

    async fn download(&self, url: &str) -> FalResult<Vec<u8>> {
        FalClient::download(self, url).await
    }
}
