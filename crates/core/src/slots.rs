//! Worker slot resolution.
//!
//! A slot is one `(device, port)` binding: the GPU/screen a render server
//! runs on and the port it listens on.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One render server binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSlot {
    pub device: u32,
    pub port: u16,
}

impl ServerSlot {
    pub fn new(device: u32, port: u16) -> Self {
        Self { device, port }
    }
}

impl From<(u32, u16)> for ServerSlot {
    fn from((device, port): (u32, u16)) -> Self {
        Self { device, port }
    }
}

/// Apply the `minimal` deployment override to a slot list.
///
/// The list is truncated to `minimal` entries but never below one; an empty
/// input is rejected.
pub fn resolve_slots(
    slots: Vec<ServerSlot>,
    minimal: Option<usize>,
) -> Result<Vec<ServerSlot>, CoreError> {
    if slots.is_empty() {
        return Err(CoreError::Validation(
            "At least one server slot is required".to_string(),
        ));
    }
    let mut slots = slots;
    if let Some(limit) = minimal {
        slots.truncate(limit.max(1));
    }
    Ok(slots)
}

/// Lay out `workers_per_gpu` servers on each of `num_gpus` devices with
/// consecutive ports, then return this rank's contiguous share.
///
/// Ports are assigned worker-major: all GPUs for the first worker index,
/// then all GPUs for the second, and so on.
pub fn build_server_configs(
    num_gpus: u32,
    workers_per_gpu: u32,
    base_port: u16,
    rank: usize,
    size: usize,
) -> Result<Vec<ServerSlot>, CoreError> {
    let mut slots = Vec::with_capacity((num_gpus * workers_per_gpu) as usize);
    let mut port = base_port;
    for _ in 0..workers_per_gpu {
        for device in 0..num_gpus {
            slots.push(ServerSlot::new(device, port));
            port = port.checked_add(1).ok_or_else(|| {
                CoreError::Validation(format!("Port range starting at {base_port} overflows"))
            })?;
        }
    }

    if size == 0 || rank >= size {
        return Err(CoreError::Validation(format!(
            "Rank {rank} is out of range for {size} ranks"
        )));
    }
    if slots.len() % size != 0 {
        return Err(CoreError::Validation(format!(
            "{} slots cannot be split evenly across {size} ranks",
            slots.len()
        )));
    }
    let chunk = slots.len() / size;
    Ok(slots[rank * chunk..(rank + 1) * chunk].to_vec())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
