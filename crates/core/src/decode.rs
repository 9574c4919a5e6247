//! Decoding of `RenderBatch` responses into stacked arrays.
//!
//! Camera frames must match the configured image size exactly; a mismatch
//! fails the whole batch. Auxiliary telemetry is best-effort: a stream whose
//! length does not divide evenly by the batch size is logged and dropped.

use std::collections::BTreeMap;

use ndarray::{Array2, Array3, Array4};

use crate::batch::StreamArray;
use crate::config::RemoteRendererConfig;
use crate::protocol::{AuxiliaryStream, RenderBatchResponse, Stream};

const DEPTH_SUFFIX: &str = "depth";
const NORMALS_SUFFIX: &str = "normals";
const SEGMENTATION_SUFFIX: &str = "segmentation";

/// Errors raised while decoding camera frames.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Stream {stream}: {mode} frame of {actual} bytes does not fit {width}x{height}")]
    FrameSize {
        stream: String,
        mode: &'static str,
        actual: usize,
        width: usize,
        height: usize,
    },

    #[error("Stream {stream}: {mode} frames have inconsistent sizes")]
    InconsistentFrames { stream: String, mode: &'static str },
}

/// Decode a response for a batch of `batch_size` entries.
pub fn convert_render_batch_response(
    response: &RenderBatchResponse,
    config: &RemoteRendererConfig,
    batch_size: usize,
) -> Result<BTreeMap<String, StreamArray>, DecodeError> {
    let dims = FrameDims {
        width: config.image_width as usize,
        height: config.image_height as usize,
    };
    let mut out = BTreeMap::new();

    for stream in &response.streams {
        decode_camera_stream(stream, dims, &mut out)?;
    }

    for aux in &response.auxiliary_float_streams {
        add_auxiliary_stream(&mut out, batch_size, aux, StreamArray::Float);
    }
    for aux in &response.auxiliary_int_streams {
        add_auxiliary_stream(&mut out, batch_size, aux, StreamArray::Int);
    }
    for aux in &response.auxiliary_bool_streams {
        add_auxiliary_stream(&mut out, batch_size, aux, StreamArray::Bool);
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy)]
struct FrameDims {
    width: usize,
    height: usize,
}

impl FrameDims {
    fn pixels(&self) -> usize {
        self.width * self.height
    }
}

fn decode_camera_stream(
    stream: &Stream,
    dims: FrameDims,
    out: &mut BTreeMap<String, StreamArray>,
) -> Result<(), DecodeError> {
    let mut rgba = Vec::new();
    let mut rgba_channels = None;
    let mut depth = Vec::new();
    let mut normals = Vec::new();
    let mut segmentation = Vec::new();
    let (mut n_rgba, mut n_depth, mut n_normals, mut n_seg) = (0, 0, 0, 0);

    for entry in &stream.entries {
        if !entry.image_data.is_empty() {
            let data = &entry.image_data;
            if dims.pixels() == 0 || data.len() % dims.pixels() != 0 {
                return Err(frame_size(stream, "image", data.len(), dims));
            }
            let channels = data.len() / dims.pixels();
            if *rgba_channels.get_or_insert(channels) != channels {
                return Err(DecodeError::InconsistentFrames {
                    stream: stream.name.clone(),
                    mode: "image",
                });
            }
            rgba.extend_from_slice(data);
            n_rgba += 1;
        }
        if !entry.depth_data.is_empty() {
            check_len(stream, DEPTH_SUFFIX, &entry.depth_data, dims.pixels() * 4, dims)?;
            depth.extend(read_f32(&entry.depth_data));
            n_depth += 1;
        }
        if !entry.normals_data.is_empty() {
            check_len(stream, NORMALS_SUFFIX, &entry.normals_data, dims.pixels() * 12, dims)?;
            normals.extend(read_f32(&entry.normals_data));
            n_normals += 1;
        }
        if !entry.segmentation_data.is_empty() {
            check_len(
                stream,
                SEGMENTATION_SUFFIX,
                &entry.segmentation_data,
                dims.pixels(),
                dims,
            )?;
            segmentation.extend_from_slice(&entry.segmentation_data);
            n_seg += 1;
        }
    }

    let (h, w) = (dims.height, dims.width);
    let channels = rgba_channels.unwrap_or(0);
    // Lengths were validated above, so the shapes always match.
    if let Ok(a) = Array4::from_shape_vec((n_rgba, h, w, channels), rgba) {
        out.insert(stream.name.clone(), StreamArray::Rgba(a));
    }
    if n_depth > 0 {
        if let Ok(a) = Array3::from_shape_vec((n_depth, h, w), depth) {
            out.insert(mode_key(&stream.name, DEPTH_SUFFIX), StreamArray::Depth(a));
        }
    }
    if n_normals > 0 {
        if let Ok(a) = Array4::from_shape_vec((n_normals, h, w, 3), normals) {
            out.insert(mode_key(&stream.name, NORMALS_SUFFIX), StreamArray::Normals(a));
        }
    }
    if n_seg > 0 {
        if let Ok(a) = Array3::from_shape_vec((n_seg, h, w), segmentation) {
            out.insert(
                mode_key(&stream.name, SEGMENTATION_SUFFIX),
                StreamArray::Segmentation(a),
            );
        }
    }
    Ok(())
}

fn add_auxiliary_stream<T: Clone>(
    out: &mut BTreeMap<String, StreamArray>,
    batch_size: usize,
    stream: &AuxiliaryStream<T>,
    wrap: fn(Array2<T>) -> StreamArray,
) {
    let len = stream.data.len();
    if batch_size == 0 || len % batch_size != 0 {
        tracing::warn!(
            stream = %stream.name,
            len,
            batch_size,
            "Dropping auxiliary stream with length not divisible by batch size",
        );
        return;
    }
    match Array2::from_shape_vec((batch_size, len / batch_size), stream.data.clone()) {
        Ok(a) => {
            out.insert(stream.name.clone(), wrap(a));
        }
        Err(e) => {
            tracing::warn!(stream = %stream.name, error = %e, "Dropping auxiliary stream");
        }
    }
}

fn mode_key(camera: &str, mode: &str) -> String {
    format!("{camera}_{mode}")
}

fn check_len(
    stream: &Stream,
    mode: &'static str,
    data: &[u8],
    expected: usize,
    dims: FrameDims,
) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(frame_size(stream, mode, data.len(), dims));
    }
    Ok(())
}

fn frame_size(stream: &Stream, mode: &'static str, actual: usize, dims: FrameDims) -> DecodeError {
    DecodeError::FrameSize {
        stream: stream.name.clone(),
        mode,
        actual,
        width: dims.width,
        height: dims.height,
    }
}

fn read_f32(data: &[u8]) -> impl Iterator<Item = f32> + '_ {
    data.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
