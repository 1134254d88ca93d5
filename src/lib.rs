pub mod classify;
pub mod config;
pub mod device;
pub mod lora;
pub mod model;
pub mod orchestrator;
pub mod posterior;
pub mod progress;
pub mod request;
pub mod schedulers;
pub mod trans;
pub mod utils;
pub mod weights;

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use config::{OffloadMode, RuntimeConfig};
use request::GenerationParams;
use schedulers::Sampler;
use thiserror::Error;
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{
    prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Errors surfaced to the caller of a style-transfer request.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unsupported model type: {}", .0.display())]
    UnsupportedModel(PathBuf),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("failed to load checkpoint {}: {reason}", .path.display())]
    CheckpointLoad { path: PathBuf, reason: String },
    #[error("failed to load base model {model}: {reason}")]
    BaseModelLoad { model: String, reason: String },
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Clone)]
#[command(author, version, about = "Apply a LoRA or checkpoint style to an image", long_about = None)]
pub struct Args {
    /// The source image, PNG or JPEG.
    #[arg(long, value_name = "FILE")]
    pub image: PathBuf,

    /// The style weights: a LoRA adapter or a full checkpoint, in .safetensors format.
    /// Bare names are looked up in the LoRA and full model directories.
    #[arg(long, value_name = "FILE")]
    pub model: String,

    /// The prompt guiding the restyle.
    #[arg(long, default_value = "")]
    prompt: String,

    #[arg(long, alias = "uncond-prompt", default_value = "")]
    negative_prompt: String,

    /// How much to transform the source image, in (0, 1]. A value of 1 discards
    /// the source image information.
    #[arg(long, default_value_t = 0.6)]
    strength: f64,

    /// Classifier-free guidance scale, guidance is skipped at or below 1.
    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 20)]
    n_steps: usize,

    /// Text encoder layers to skip, 1 uses all of them.
    #[arg(long, default_value_t = 2)]
    clip_skip: usize,

    #[arg(long, default_value_t = Sampler::default())]
    sampler: Sampler,

    #[arg(long)]
    seed: Option<u64>,

    /// Seed offset used to derive the seeds of the variants after the first.
    #[arg(long)]
    variance_seed: Option<u64>,

    /// Blend each variant's noise from the base seed towards its own seed by this amount.
    #[arg(long)]
    variance_strength: Option<f64>,

    /// The number of variants to generate.
    #[arg(long, default_value_t = 1)]
    pub num_samples: usize,

    /// Integer factor applied to the output resolution, at most 4.
    #[arg(long, default_value_t = 1)]
    upscale: u32,

    /// Multiplier applied to LoRA deltas when merging them.
    #[arg(long, default_value_t = 1.0)]
    adapter_scale: f64,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "restyled.png")]
    pub final_image: String,

    /// Run on CPU rather than on GPU.
    #[arg(long, env = "FORCE_CPU")]
    cpu: bool,

    /// Accelerators with less memory than this get CPU offload in auto mode.
    #[arg(long, env = "MAX_MEMORY_GB", default_value_t = 8.0)]
    max_memory_gb: f64,

    #[arg(long, env = "ENABLE_ATTENTION_SLICING", action = ArgAction::Set, default_value_t = true)]
    attention_slicing: bool,

    /// auto, true or false.
    #[arg(long, env = "ENABLE_CPU_OFFLOAD", default_value_t = OffloadMode::Auto)]
    cpu_offload: OffloadMode,

    #[arg(long, env = "LORA_MODELS_PATH", default_value = "/data/loras")]
    lora_models_path: PathBuf,

    #[arg(long, env = "FULL_MODELS_PATH", default_value = "/data/models")]
    full_models_path: PathBuf,

    /// Hugging Face home, models are cached under its `hub` directory.
    #[arg(long, env = "HF_HOME")]
    cache_dir: Option<PathBuf>,

    /// The hub repository providing the base model for LoRA adapters.
    #[arg(long, env = "BASE_MODEL", default_value = config::DEFAULT_BASE_MODEL)]
    base_model: String,

    #[arg(long)]
    use_flash_attn: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

impl Args {
    /// Installs the log subscriber. The returned guard flushes the chrome trace
    /// when dropped.
    pub fn check(&self) -> anyhow::Result<Option<FlushGuard>> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt = tracing_subscriber::fmt::layer().with_target(false);

        if self.tracing {
            let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt)
                .with(chrome_layer)
                .try_init()?;
            Ok(Some(guard))
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt)
                .try_init()?;
            Ok(None)
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            force_cpu: self.cpu,
            max_memory_gb: self.max_memory_gb,
            attention_slicing: self.attention_slicing,
            cpu_offload: self.cpu_offload,
            lora_models_path: self.lora_models_path.clone(),
            full_models_path: self.full_models_path.clone(),
            cache_dir: self.cache_dir.clone(),
            base_model: self.base_model.clone(),
            use_flash_attn: self.use_flash_attn,
        }
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            strength: self.strength,
            guidance_scale: self.guidance_scale,
            steps: self.n_steps,
            clip_skip: self.clip_skip,
            sampler: self.sampler,
            seed: self.seed,
            variance_seed: self.variance_seed,
            variance_strength: self.variance_strength,
            num_images: self.num_samples,
            upscale_factor: self.upscale,
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            adapter_scale: self.adapter_scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_params_and_config() {
        let args = Args::parse_from([
            "restyle",
            "--image",
            "in.png",
            "--model",
            "style.safetensors",
            "--sampler",
            "EulerAncestralDiscreteScheduler",
            "--cpu-offload",
            "off",
            "--attention-slicing",
            "false",
            "--seed",
            "42",
        ]);
        let params = args.params();
        assert_eq!(params.sampler, Sampler::EulerAncestralDiscrete);
        assert_eq!(params.seed, Some(42));
        assert_eq!(params.steps, 20);
        let config = args.runtime_config();
        assert_eq!(config.cpu_offload, OffloadMode::Off);
        assert!(!config.attention_slicing);
    }

    #[test]
    fn family_comes_from_the_base_model_only() {
        let args = Args::parse_from([
            "restyle",
            "--image",
            "in.png",
            "--model",
            "m",
            "--base-model",
            "stabilityai/stable-diffusion-xl-base-1.0",
        ]);
        assert_eq!(
            model::StableDiffusionVersion::from_repo(&args.runtime_config().base_model),
            model::StableDiffusionVersion::Xl
        );
        let parsed = Args::try_parse_from([
            "restyle", "--image", "in.png", "--model", "m", "--sd-version", "xl",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_sampler_is_rejected() {
        let parsed = Args::try_parse_from([
            "restyle",
            "--image",
            "in.png",
            "--model",
            "m",
            "--sampler",
            "PNDMScheduler",
        ]);
        assert!(parsed.is_err());
    }
}
