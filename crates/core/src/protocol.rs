//! Render service wire messages.
//!
//! The render server speaks JSON over HTTP. Frame payloads are raw
//! little-endian pixel buffers carried as base64 strings; an empty string
//! (or a missing field) means the mode was not rendered for that entry.

use serde::{Deserialize, Serialize};

use crate::config::RendererConfig;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `POST /update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub components: Vec<serde_json::Value>,
}

impl From<&RendererConfig> for UpdateRequest {
    fn from(config: &RendererConfig) -> Self {
        Self {
            components: config.components.clone(),
        }
    }
}

/// One state to render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub qpos: Vec<f64>,
    /// Only honoured when the request sets `use_entry_seeds`.
    #[serde(default)]
    pub seed: i32,
}

/// Body of `POST /render_batch`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderBatchRequest {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub batch_seed: i32,
    #[serde(default)]
    pub use_entry_seeds: bool,
    #[serde(default)]
    pub render_alpha: bool,
    #[serde(default)]
    pub render_depth: bool,
    #[serde(default)]
    pub render_normals: bool,
    #[serde(default)]
    pub render_segmentation: bool,
    pub camera_names: Vec<String>,
    pub entries: Vec<RequestEntry>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// All frames rendered for one entry by one camera.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    #[serde(default, with = "base64_bytes")]
    pub image_data: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub depth_data: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub normals_data: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub segmentation_data: Vec<u8>,
}

/// Frames for one camera, in entry order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<StreamEntry>,
}

/// Flat scalar telemetry; `data.len()` must be a multiple of the batch size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryStream<T> {
    pub name: String,
    #[serde(default)]
    pub data: Vec<T>,
}

/// Response of `POST /render_batch`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderBatchResponse {
    #[serde(default)]
    pub streams: Vec<Stream>,
    #[serde(default)]
    pub auxiliary_float_streams: Vec<AuxiliaryStream<f64>>,
    #[serde(default)]
    pub auxiliary_int_streams: Vec<AuxiliaryStream<i64>>,
    #[serde(default)]
    pub auxiliary_bool_streams: Vec<AuxiliaryStream<bool>>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
