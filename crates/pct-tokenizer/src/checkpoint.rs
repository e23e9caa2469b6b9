//! Checkpoint persistence.
//!
//! Weights are stored as a flat safetensors tensor map; the trainable
//! variables are merged with the live codebook/EMA buffers, which evolve
//! outside the variable map. Optimizer state rides in the same file under
//! its own key prefix and is treated as opaque. Epoch and last loss travel
//! in a small JSON sidecar next to the weight file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use pct_core::{Error, Result};

use crate::model::PoseTokenizer;

/// Training-progress record persisted alongside the weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub loss: f32,
}

/// Key prefix separating optimizer state from model weights inside the
/// shared safetensors file.
const OPTIMIZER_PREFIX: &str = "optimizer.";

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

/// A loaded checkpoint, split back into its parts.
pub struct Checkpoint {
    pub model: HashMap<String, Tensor>,
    /// Optimizer tensors as handed to [`save_checkpoint`], prefix stripped.
    /// Their layout is owned by the training loop.
    pub optimizer: HashMap<String, Tensor>,
    pub meta: CheckpointMeta,
}

/// Save model weights, optional optimizer state, and training progress.
pub fn save_checkpoint(
    model: &PoseTokenizer,
    varmap: &VarMap,
    optimizer: Option<&HashMap<String, Tensor>>,
    meta: &CheckpointMeta,
    path: &Path,
) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();

    // The codebook and EMA buffers are updated in place each training step;
    // persist the live values, not the initial variables.
    for (name, tensor) in model.quantizer_state() {
        tensors.insert(name, tensor);
    }

    if let Some(optimizer) = optimizer {
        for (name, tensor) in optimizer {
            tensors.insert(format!("{OPTIMIZER_PREFIX}{name}"), tensor.clone());
        }
    }

    candle_core::safetensors::save(&tensors, path)?;

    let json = serde_json::to_string_pretty(meta)?;
    std::fs::write(meta_path(path), json).map_err(|e| Error::Serialization(e.to_string()))?;

    tracing::debug!(path = %path.display(), epoch = meta.epoch, "checkpoint saved");
    Ok(())
}

/// Load a checkpoint's tensor maps and training progress.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Checkpoint> {
    let tensors = candle_core::safetensors::load(path, device)?;

    let mut model = HashMap::new();
    let mut optimizer = HashMap::new();
    for (name, tensor) in tensors {
        match name.strip_prefix(OPTIMIZER_PREFIX) {
            Some(rest) => {
                optimizer.insert(rest.to_string(), tensor);
            }
            None => {
                model.insert(name, tensor);
            }
        }
    }

    let meta = std::fs::read_to_string(meta_path(path))
        .map_err(|e| Error::ModelLoad(format!("missing checkpoint metadata: {e}")))?;
    let meta: CheckpointMeta = serde_json::from_str(&meta)?;

    Ok(Checkpoint {
        model,
        optimizer,
        meta,
    })
}
