//! Tripo3D generation options.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Texture quality requested from the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TextureQuality {
    #[default]
    Standard,
    Detailed,
}

/// Model orientation relative to the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Default,
    AlignImage,
}

/// Options applied to every file of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct GenerationOptions {
    /// Generate a textured model
    #[serde(default = "default_true")]
    pub texture: bool,

    /// Generate PBR materials
    #[serde(default = "default_true")]
    pub pbr: bool,

    #[serde(default)]
    pub texture_quality: TextureQuality,

    /// Target face count of the mesh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1000, max = 500000))]
    pub face_limit: Option<u32>,

    #[serde(default)]
    pub orientation: Orientation,
}

fn default_true() -> bool {
    true
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            texture: true,
            pbr: true,
            texture_quality: TextureQuality::default(),
            face_limit: None,
            orientation: Orientation::default(),
        }
    }
}
