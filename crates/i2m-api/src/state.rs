//! Application state.

use std::sync::Arc;

use i2m_storage::{FileStorage, StorageConfig};
use i2m_store::{JobStore, ProgressStore, QueueConfig, SessionStore, TaskQueue};

use crate::config::ApiConfig;
use crate::services::StreamTracker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub jobs: JobStore,
    pub sessions: SessionStore,
    pub progress: ProgressStore,
    pub queue: TaskQueue,
    pub storage: FileStorage,
    pub streams: StreamTracker,
}

impl AppState {
    /// Create new application state.
    pub async fn new(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = FileStorage::new(StorageConfig::from_env());
        storage.init().await?;

        let queue_config = QueueConfig {
            redis_url: config.redis_url.clone(),
            ..QueueConfig::from_env()
        };

        Self::from_parts(config, queue_config, storage)
    }

    /// Build state without touching the network or the filesystem.
    ///
    /// Redis clients connect lazily on first use.
    pub fn from_parts(
        config: ApiConfig,
        queue_config: QueueConfig,
        storage: FileStorage,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let queue = TaskQueue::new(queue_config)?;
        let streams = StreamTracker::new(config.max_streams_per_session);

        Ok(Self {
            config: Arc::new(config),
            jobs: JobStore::from_client(client.clone()),
            sessions: SessionStore::from_client(client.clone()),
            progress: ProgressStore::from_client(client),
            queue,
            storage,
            streams,
        })
    }
}
