//! Render batches: the caller-facing workload and its decoded results.

use std::collections::BTreeMap;

use ndarray::{Array2, Array3, Array4};

use crate::config::RemoteRendererConfig;
use crate::error::CoreError;
use crate::protocol::{RenderBatchRequest, RequestEntry};

/// Batch seeds are truncated to fit the server's signed 32-bit field.
const BATCH_SEED_MODULUS: u64 = 1 << 31;

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// Randomization seed for a batch.
///
/// Either one seed for the whole batch, from which the server derives the
/// entry seeds, or an explicit seed per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seed {
    Batch(u64),
    PerEntry(Vec<i32>),
}

// ---------------------------------------------------------------------------
// StreamArray
// ---------------------------------------------------------------------------

/// A decoded stream, stacked along the first axis in entry order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamArray {
    /// `[N, H, W, C]` colour frames.
    Rgba(Array4<u8>),
    /// `[N, H, W]` depth frames.
    Depth(Array3<f32>),
    /// `[N, H, W, 3]` surface normals.
    Normals(Array4<f32>),
    /// `[N, H, W]` per-pixel category ids.
    Segmentation(Array3<u8>),
    /// `[N, K]` auxiliary telemetry.
    Float(Array2<f64>),
    Int(Array2<i64>),
    Bool(Array2<bool>),
}

impl StreamArray {
    /// Number of entries (size of the first axis).
    pub fn len(&self) -> usize {
        match self {
            Self::Rgba(a) => a.len_of(ndarray::Axis(0)),
            Self::Depth(a) => a.len_of(ndarray::Axis(0)),
            Self::Normals(a) => a.len_of(ndarray::Axis(0)),
            Self::Segmentation(a) => a.len_of(ndarray::Axis(0)),
            Self::Float(a) => a.nrows(),
            Self::Int(a) => a.nrows(),
            Self::Bool(a) => a.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full array shape.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Rgba(a) => a.shape(),
            Self::Depth(a) => a.shape(),
            Self::Normals(a) => a.shape(),
            Self::Segmentation(a) => a.shape(),
            Self::Float(a) => a.shape(),
            Self::Int(a) => a.shape(),
            Self::Bool(a) => a.shape(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A set of scene states rendered together.
///
/// After rendering, `streams` holds the decoded outputs keyed by
/// `<camera>`, `<camera>_<mode>` or the auxiliary stream name, so the
/// result carries both the original states and the new outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    states: Vec<Vec<f64>>,
    seed: Seed,
    pub streams: BTreeMap<String, StreamArray>,
}

impl Batch {
    /// Build a batch, checking that per-entry seeds line up with the states.
    pub fn new(states: Vec<Vec<f64>>, seed: Seed) -> Result<Self, CoreError> {
        if states.is_empty() {
            return Err(CoreError::Validation(
                "A batch needs at least one state".to_string(),
            ));
        }
        if let Seed::PerEntry(seeds) = &seed {
            if seeds.len() != states.len() {
                return Err(CoreError::Validation(format!(
                    "Got {} entry seeds for {} states",
                    seeds.len(),
                    states.len()
                )));
            }
        }
        Ok(Self {
            states,
            seed,
            streams: BTreeMap::new(),
        })
    }

    /// Shorthand for a batch-seeded batch.
    pub fn with_batch_seed(states: Vec<Vec<f64>>, seed: u64) -> Result<Self, CoreError> {
        Self::new(states, Seed::Batch(seed))
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn stream(&self, name: &str) -> Option<&StreamArray> {
        self.streams.get(name)
    }

    /// Merge decoded streams into the batch, replacing same-named ones.
    pub fn merge_streams(&mut self, streams: BTreeMap<String, StreamArray>) {
        self.streams.extend(streams);
    }
}

/// Frame a batch as a `RenderBatch` request using the pool's render flags.
pub fn build_render_batch_request(
    batch: &Batch,
    config: &RemoteRendererConfig,
) -> RenderBatchRequest {
    let (batch_seed, entry_seeds) = match batch.seed() {
        Seed::Batch(seed) => ((seed % BATCH_SEED_MODULUS) as i32, None),
        Seed::PerEntry(seeds) => (0, Some(seeds)),
    };

    let entries = batch
        .states()
        .iter()
        .enumerate()
        .map(|(i, qpos)| RequestEntry {
            qpos: qpos.clone(),
            seed: entry_seeds.map(|s| s[i]).unwrap_or_default(),
        })
        .collect();

    RenderBatchRequest {
        width: config.image_width,
        height: config.image_height,
        batch_seed,
        use_entry_seeds: entry_seeds.is_some(),
        render_alpha: config.render_alpha,
        render_depth: config.render_depth,
        render_normals: config.render_normals,
        render_segmentation: config.render_segmentation,
        camera_names: config.camera_names.clone(),
        entries,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
