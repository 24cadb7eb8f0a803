//! FAL queue API and Tripo3D payloads.

use serde::{Deserialize, Serialize};

use i2m_models::{GenerationOptions, Orientation, TextureQuality};

/// Image handed to the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl ImageInput {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Encode as a `data:` URI.
    pub fn to_data_uri(&self) -> String {
        use base64::Engine;
        format!(
            "data:{};base64,{}",
            self.content_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Tripo3D image-to-3D request body.
#[derive(Debug, Clone, Serialize)]
pub struct TripoRequest {
    pub image_url: String,
    /// `no`, `standard` or `HD`
    pub texture: &'static str,
    pub pbr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_limit: Option<u32>,
    /// `default` or `align_image`
    pub orientation: &'static str,
}

impl TripoRequest {
    pub fn new(image_url: impl Into<String>, options: &GenerationOptions) -> Self {
        let texture = match (options.texture, options.texture_quality) {
            (false, _) => "no",
            (true, TextureQuality::Standard) => "standard",
            (true, TextureQuality::Detailed) => "HD",
        };
        let orientation = match options.orientation {
            Orientation::Default => "default",
            Orientation::AlignImage => "align_image",
        };

        Self {
            image_url: image_url.into(),
            texture,
            pbr: options.texture && options.pbr,
            face_limit: options.face_limit,
            orientation,
        }
    }
}

/// Response to a queue submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: String,
    #[serde(default)]
    pub status_url: Option<String>,
    #[serde(default)]
    pub response_url: Option<String>,
}

/// Queue state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    InQueue,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLog {
    pub message: String,
}

/// Response of the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub status: QueueState,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub response_url: Option<String>,
    #[serde(default)]
    pub logs: Option<Vec<QueueLog>>,
}

impl QueueStatus {
    /// Most recent log line, if any.
    pub fn last_log(&self) -> Option<&str> {
        self.logs
            .as_ref()
            .and_then(|logs| logs.last())
            .map(|l| l.message.as_str())
    }
}

/// File reference returned by FAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FalFile {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Tripo3D result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripoResult {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub model_mesh: Option<FalFile>,
    #[serde(default)]
    pub pbr_model: Option<FalFile>,
    #[serde(default)]
    pub base_model: Option<FalFile>,
    #[serde(default)]
    pub rendered_image: Option<FalFile>,
}

impl TripoResult {
    /// The best model file in the result.
    pub fn primary_model(&self) -> Option<&FalFile> {
        self.model_mesh
            .as_ref()
            .or(self.pbr_model.as_ref())
            .or(self.base_model.as_ref())
    }
}

/// Finished generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedModel {
    pub request_id: String,
    pub model: FalFile,
    pub rendered_image: Option<FalFile>,
}

/// State changes reported while a generation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationUpdate {
    /// Request accepted by the queue
    Submitted { request_id: String },
    /// Waiting for a runner
    Queued { position: Option<u32> },
    /// Running, with the poll count since it started
    InProgress { polls: u32, log: Option<String> },
    /// Result is ready
    Completed,
}
