//! Best-effort detection of what a weights file is.
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use tracing::{debug, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Files above this size are full checkpoints whatever their keys say.
pub const FULL_CHECKPOINT_MIN_SIZE: u64 = 2 * GIB;

/// Files below this size are adapters when the keys are inconclusive.
pub const ADAPTER_MAX_SIZE: u64 = GIB;

/// Weights file used when an adapter is given as a directory.
pub const ADAPTER_WEIGHTS_NAME: &str = "pytorch_lora_weights.safetensors";

const LORA_MARKERS: [&str; 9] = [
    "lora_unet",
    "lora_te",
    "lora_down",
    "lora_up",
    "lora.down",
    "lora.up",
    "lora_A",
    "lora_B",
    ".alpha",
];

const CHECKPOINT_MARKERS: [&str; 4] = [
    "model.diffusion_model",
    "first_stage_model",
    "cond_stage_model",
    "conditioner.embedders",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    LoraAdapter,
    FullCheckpoint,
    Unknown,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoraAdapter => f.write_str("LoRA adapter"),
            Self::FullCheckpoint => f.write_str("full checkpoint"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A classified weights file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub path: PathBuf,
    pub kind: ModelKind,
}

impl ModelReference {
    pub fn classify(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = classify(&path);
        Self { path, kind }
    }
}

/// Maps an adapter directory to the weights file inside it.
pub fn weights_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(ADAPTER_WEIGHTS_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Classifies a weights file from its size and tensor names. Never fails, a
/// file that cannot be read is `Unknown`.
pub fn classify(path: &Path) -> ModelKind {
    let file = weights_file(path);
    let size = match std::fs::metadata(&file) {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            warn!("cannot read {}: {err}", file.display());
            return ModelKind::Unknown;
        }
    };
    if size > FULL_CHECKPOINT_MIN_SIZE {
        debug!(size, "large file, assuming a full checkpoint");
        return ModelKind::FullCheckpoint;
    }

    let keys = match tensor_names(&file) {
        Ok(keys) => keys,
        Err(err) => {
            warn!("cannot detect the model type of {}: {err:#}", file.display());
            return ModelKind::Unknown;
        }
    };
    classify_keys(&keys, size)
}

fn classify_keys(keys: &[String], size: u64) -> ModelKind {
    let has_marker = |markers: &[&str]| {
        keys.iter()
            .any(|key| markers.iter().any(|marker| key.contains(marker)))
    };
    if has_marker(&LORA_MARKERS) {
        ModelKind::LoraAdapter
    } else if has_marker(&CHECKPOINT_MARKERS) {
        ModelKind::FullCheckpoint
    } else if size < ADAPTER_MAX_SIZE {
        ModelKind::LoraAdapter
    } else {
        warn!(size, "no known tensor names, the model type is unknown");
        ModelKind::Unknown
    }
}

/// Lists the tensor names from the safetensors header.
pub fn tensor_names(path: &Path) -> Result<Vec<String>> {
    let tensors = unsafe { MmapedSafetensors::new(path) }
        .with_context(|| format!("reading safetensors header of {}", path.display()))?;
    Ok(tensors.tensors().into_iter().map(|(name, _)| name).collect())
}
