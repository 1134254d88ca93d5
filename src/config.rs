//! Runtime configuration, read once from the command line and environment and
//! then passed by value into each request.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::{Error, Result};

pub const DEFAULT_BASE_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";

/// How the CPU offload decision is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffloadMode {
    /// Offload on the CPU target or when the accelerator is small.
    #[default]
    Auto,
    On,
    Off,
}

impl fmt::Display for OffloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::On => "true",
            Self::Off => "false",
        };
        f.write_str(s)
    }
}

impl FromStr for OffloadMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "true" | "on" | "1" => Ok(Self::On),
            "false" | "off" | "0" => Ok(Self::Off),
            other => Err(format!("expected auto, true or false, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub force_cpu: bool,
    pub max_memory_gb: f64,
    pub attention_slicing: bool,
    pub cpu_offload: OffloadMode,
    pub lora_models_path: PathBuf,
    pub full_models_path: PathBuf,
    /// Hugging Face home directory, `None` keeps the hub client's default.
    pub cache_dir: Option<PathBuf>,
    pub base_model: String,
    pub use_flash_attn: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            force_cpu: false,
            max_memory_gb: 8.0,
            attention_slicing: true,
            cpu_offload: OffloadMode::Auto,
            lora_models_path: PathBuf::from("/data/loras"),
            full_models_path: PathBuf::from("/data/models"),
            cache_dir: None,
            base_model: DEFAULT_BASE_MODEL.to_string(),
            use_flash_attn: false,
        }
    }
}

impl RuntimeConfig {
    /// Resolves a model argument to a path: as given when it exists, then
    /// under the LoRA directory, then under the full model directory.
    pub fn resolve_model(&self, name: &str) -> Result<PathBuf> {
        let given = Path::new(name);
        if given.exists() {
            return Ok(given.to_path_buf());
        }
        for dir in [&self.lora_models_path, &self.full_models_path] {
            let candidate = dir.join(name);
            debug!(candidate = %candidate.display(), "looking up model");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::ModelNotFound(name.to_string()))
    }
}
