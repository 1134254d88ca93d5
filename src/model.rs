use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::sync::{Api, ApiBuilder};
use tracing::debug;

use crate::schedulers::PredictionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
    Xl,
}

impl StableDiffusionVersion {
    /// Infers the family from a hub repository id such as
    /// `stabilityai/stable-diffusion-xl-base-1.0`.
    pub fn from_repo(repo: &str) -> Self {
        let repo = repo.to_ascii_lowercase();
        if repo.contains("xl") {
            Self::Xl
        } else if repo.contains("2-1") || repo.contains("2.1") || repo.contains("diffusion-2") {
            Self::V2_1
        } else {
            Self::V1_5
        }
    }

    /// The reference repository, used for components a checkpoint lacks.
    pub fn repo(&self) -> &'static str {
        match self {
            Self::Xl => "stabilityai/stable-diffusion-xl-base-1.0",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
            Self::V1_5 => "runwayml/stable-diffusion-v1-5",
        }
    }

    pub fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
            Self::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, None, None),
        }
    }

    /// Factor between autoencoder latents and the UNet's latent space.
    pub fn latent_scale(&self) -> f64 {
        match self {
            Self::V1_5 | Self::V2_1 => 0.18215,
            Self::Xl => 0.13025,
        }
    }

    pub fn prediction_type(&self) -> PredictionType {
        match self {
            Self::V2_1 => PredictionType::VPrediction,
            Self::V1_5 | Self::Xl => PredictionType::Epsilon,
        }
    }

    /// Number of text encoders feeding the UNet.
    pub fn text_encoders(&self) -> usize {
        match self {
            Self::Xl => 2,
            Self::V1_5 | Self::V2_1 => 1,
        }
    }

    pub fn unet_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "unet/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "unet/diffusion_pytorch_model.safetensors"
        }
    }

    pub fn vae_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "vae/diffusion_pytorch_model.fp16.safetensors"
        } else {
            "vae/diffusion_pytorch_model.safetensors"
        }
    }

    pub fn clip_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "text_encoder/model.fp16.safetensors"
        } else {
            "text_encoder/model.safetensors"
        }
    }

    pub fn clip2_file(&self, use_f16: bool) -> &'static str {
        if use_f16 {
            "text_encoder_2/model.fp16.safetensors"
        } else {
            "text_encoder_2/model.safetensors"
        }
    }
}

/// Access to the model hub. Files of the configured base family come from the
/// base repository, other families from their reference repository.
pub struct ModelHub {
    api: Api,
    base_model: String,
}

impl ModelHub {
    /// `cache_dir` is a Hugging Face home, the hub cache lives under its `hub`
    /// directory.
    pub fn new(base_model: &str, cache_dir: Option<&Path>) -> Result<Self> {
        let builder = ApiBuilder::new().with_progress(true);
        let builder = match cache_dir {
            Some(dir) => builder.with_cache_dir(dir.join("hub")),
            None => builder,
        };
        Ok(Self {
            api: builder.build().context("creating the hub client")?,
            base_model: base_model.to_string(),
        })
    }

    pub fn base_model(&self) -> &str {
        &self.base_model
    }

    pub fn base_version(&self) -> StableDiffusionVersion {
        StableDiffusionVersion::from_repo(&self.base_model)
    }

    fn repo(&self, version: StableDiffusionVersion) -> String {
        if version == self.base_version() {
            self.base_model.clone()
        } else {
            version.repo().to_string()
        }
    }

    fn fetch(&self, repo: &str, path: &str) -> Result<PathBuf> {
        debug!(repo, path, "fetching from the hub");
        self.api
            .model(repo.to_string())
            .get(path)
            .with_context(|| format!("fetching {path} from {repo}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    Tokenizer,
    Tokenizer2,
    Clip,
    Clip2,
    Unet,
    Vae,
}

impl ModelFile {
    pub fn get(
        &self,
        hub: &ModelHub,
        version: StableDiffusionVersion,
        use_f16: bool,
    ) -> Result<PathBuf> {
        let repo = hub.repo(version);
        let (repo, path) = match self {
            Self::Tokenizer => {
                let tokenizer_repo = match version {
                    StableDiffusionVersion::V1_5 | StableDiffusionVersion::V2_1 => {
                        "openai/clip-vit-base-patch32"
                    }
                    StableDiffusionVersion::Xl => {
                        // This seems similar to the patch32 version except some very small
                        // difference in the split regex.
                        "openai/clip-vit-large-patch14"
                    }
                };
                (tokenizer_repo.to_string(), "tokenizer.json")
            }
            Self::Tokenizer2 => (
                "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k".to_string(),
                "tokenizer.json",
            ),
            Self::Clip => (repo, version.clip_file(use_f16)),
            Self::Clip2 => (repo, version.clip2_file(use_f16)),
            Self::Unet => (repo, version.unet_file(use_f16)),
            Self::Vae => {
                // Override for SDXL when using f16 weights.
                // See https://github.com/huggingface/candle/issues/1060
                if version == StableDiffusionVersion::Xl && use_f16 {
                    (
                        "madebyollin/sdxl-vae-fp16-fix".to_string(),
                        "diffusion_pytorch_model.safetensors",
                    )
                } else {
                    (repo, version.vae_file(use_f16))
                }
            }
        };
        hub.fetch(&repo, path)
    }
}
