//! Filesystem storage implementation.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use i2m_models::JobId;

use crate::error::{StorageError, StorageResult};

/// Configuration for file storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory for uploaded images
    pub upload_dir: PathBuf,
    /// Directory for generated models
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./data/uploads"),
            output_dir: PathBuf::from("./data/results"),
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/uploads")),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/results")),
        }
    }
}

/// A stored model file.
#[derive(Debug, Clone, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Upload and output storage rooted at two directories.
///
/// Layout: `{upload_dir}/{job_id}/{stored_name}` and
/// `{output_dir}/{job_id}/{model_filename}`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl FileStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            upload_dir: config.upload_dir,
            output_dir: config.output_dir,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> Self {
        Self::new(StorageConfig::from_env())
    }

    /// Create the root directories if missing.
    pub async fn init(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.upload_dir).await?;
        fs::create_dir_all(&self.output_dir).await?;
        info!(
            upload_dir = %self.upload_dir.display(),
            output_dir = %self.output_dir.display(),
            "File storage initialized"
        );
        Ok(())
    }

    /// Check that both roots exist and are directories.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        for dir in [&self.upload_dir, &self.output_dir] {
            let meta = fs::metadata(dir).await?;
            if !meta.is_dir() {
                return Err(StorageError::config_error(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Path of an uploaded image.
    pub fn upload_path(&self, job_id: &JobId, stored_name: &str) -> StorageResult<PathBuf> {
        Ok(self
            .job_dir(&self.upload_dir, job_id)?
            .join(validate_component(stored_name)?))
    }

    /// Path of a generated model.
    pub fn model_path(&self, job_id: &JobId, filename: &str) -> StorageResult<PathBuf> {
        Ok(self
            .job_dir(&self.output_dir, job_id)?
            .join(validate_component(filename)?))
    }

    /// Write an uploaded image.
    pub async fn save_upload(
        &self,
        job_id: &JobId,
        stored_name: &str,
        data: &[u8],
    ) -> StorageResult<PathBuf> {
        let path = self.upload_path(job_id, stored_name)?;
        write_file(&path, data).await?;
        debug!("Saved upload {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    /// Read an uploaded image.
    pub async fn read_upload(&self, job_id: &JobId, stored_name: &str) -> StorageResult<Vec<u8>> {
        let path = self.upload_path(job_id, stored_name)?;
        read_file(&path).await
    }

    /// Write a generated model.
    pub async fn write_model(
        &self,
        job_id: &JobId,
        filename: &str,
        data: &[u8],
    ) -> StorageResult<PathBuf> {
        let path = self.model_path(job_id, filename)?;
        write_file(&path, data).await?;
        info!("Stored model {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    /// Open a generated model for streaming.
    pub async fn open_model(&self, job_id: &JobId, filename: &str) -> StorageResult<(fs::File, u64)> {
        let path = self.model_path(job_id, filename)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(format!("{}/{}", job_id, filename)));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// List the generated models of a job.
    pub async fn list_models(&self, job_id: &JobId) -> StorageResult<Vec<StoredFile>> {
        let dir = self.job_dir(&self.output_dir, job_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            files.push(StoredFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Remove every upload and model of a job. Returns true if anything was removed.
    pub async fn delete_job_files(&self, job_id: &JobId) -> StorageResult<bool> {
        let mut removed = false;
        for root in [&self.upload_dir, &self.output_dir] {
            let dir = self.job_dir(root, job_id)?;
            match fs::remove_dir_all(&dir).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::delete_failed(format!("{}: {}", dir.display(), e))),
            }
        }
        Ok(removed)
    }

    /// Remove job directories whose last modification is older than `max_age`.
    ///
    /// Returns the number of directories removed across both roots.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> StorageResult<u32> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0u32;

        for root in [&self.upload_dir, &self.output_dir] {
            let mut entries = match fs::read_dir(root).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if !meta.is_dir() {
                    continue;
                }
                let modified = meta.modified().unwrap_or(SystemTime::now());
                if modified < cutoff {
                    match fs::remove_dir_all(entry.path()).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
                    }
                }
            }
        }

        if removed > 0 {
            info!("Cleanup removed {} job directories", removed);
        }
        Ok(removed)
    }

    fn job_dir(&self, root: &Path, job_id: &JobId) -> StorageResult<PathBuf> {
        if !job_id.is_valid() {
            return Err(StorageError::invalid_key(job_id.as_str()));
        }
        Ok(root.join(job_id.as_str()))
    }
}

/// Reject anything that could escape the job directory.
fn validate_component(name: &str) -> StorageResult<&str> {
    let bad = name.is_empty()
        || name.len() > 255
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::invalid_key(name));
    }
    Ok(name)
}

async fn write_file(path: &Path, data: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    // Write to a sibling temp file so readers never see a partial file.
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.part", file_name));
    fs::write(&tmp, data)
        .await
        .map_err(|e| StorageError::write_failed(format!("{}: {}", path.display(), e)))?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_file(path: &Path) -> StorageResult<Vec<u8>> {
    match fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StorageError::not_found(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> FileStorage {
        FileStorage::new(StorageConfig {
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("results"),
        })
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.init().await.unwrap();

        let job_id = JobId::new();
        storage.save_upload(&job_id, "a.png", b"png-bytes").await.unwrap();
        let data = storage.read_upload(&job_id, "a.png").await.unwrap();
        assert_eq!(data, b"png-bytes");
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let job_id = JobId::new();

        assert!(storage.save_upload(&job_id, "../evil", b"x").await.is_err());
        assert!(storage.model_path(&job_id, ".env").is_err());
        assert!(storage
            .model_path(&JobId::from_string("../../tmp"), "a.glb")
            .is_err());
    }

    #[tokio::test]
    async fn test_models_listing_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let job_id = JobId::new();

        assert!(storage.list_models(&job_id).await.unwrap().is_empty());

        storage.write_model(&job_id, "b.glb", b"bb").await.unwrap();
        storage.write_model(&job_id, "a.glb", b"a").await.unwrap();

        let models = storage.list_models(&job_id).await.unwrap();
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a.glb", "b.glb"]);

        let (_, len) = storage.open_model(&job_id, "b.glb").await.unwrap();
        assert_eq!(len, 2);

        let missing = storage.open_model(&job_id, "c.glb").await.unwrap_err();
        assert!(matches!(missing, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_job_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let job_id = JobId::new();

        assert!(!storage.delete_job_files(&job_id).await.unwrap());
        storage.save_upload(&job_id, "a.png", b"x").await.unwrap();
        storage.write_model(&job_id, "a.glb", b"y").await.unwrap();
        assert!(storage.delete_job_files(&job_id).await.unwrap());
        assert!(storage.list_models(&job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.init().await.unwrap();
        let job_id = JobId::new();
        storage.save_upload(&job_id, "a.png", b"x").await.unwrap();

        let removed = storage
            .cleanup_older_than(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = storage.cleanup_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
    }
}
