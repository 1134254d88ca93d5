//! The candle implementation of [`Backend`].
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer,
    clip::{ClipTextTransformer, Config as ClipConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use tempfile::TempDir;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::device::{self, ExecutionTarget};
use crate::lora::{self, LoraAdapter, MergeStrategy};
use crate::model::{ModelFile, ModelHub, StableDiffusionVersion};
use crate::orchestrator::{Backend, ModelSource, Pipeline, PipelineError, Placement};
use crate::posterior::{EncoderConfig, PosteriorEncoder};
use crate::request::{GenerationParams, VariantPlan};
use crate::schedulers::Sampler;
use crate::utils::{image_to_tensor, tensor_to_image};
use crate::weights;

/// Attention slice size used when slicing is enabled.
const AUTO_SLICE_SIZE: usize = 4;

const ACCELERATOR_MARKERS: [&str; 3] = ["cuda", "metal", "out of memory"];

/// Sorts a failure into errors worth retrying on the CPU and everything else.
fn pipeline_error(err: E, target: ExecutionTarget) -> PipelineError {
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();
    if target == ExecutionTarget::Accelerated
        && ACCELERATOR_MARKERS.iter().any(|marker| lower.contains(marker))
    {
        PipelineError::Accelerator(msg)
    } else {
        PipelineError::Other(msg)
    }
}

pub struct CandleBackend {
    hub: ModelHub,
    config: RuntimeConfig,
}

impl CandleBackend {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let hub = ModelHub::new(&config.base_model, config.cache_dir.as_deref())?;
        Ok(Self {
            hub,
            config: config.clone(),
        })
    }
}

impl Backend for CandleBackend {
    type Pipeline = StylePipeline;

    fn load(
        &mut self,
        source: &ModelSource,
        placement: &Placement,
        clip_skip: usize,
    ) -> std::result::Result<StylePipeline, PipelineError> {
        StylePipeline::load(&self.hub, &self.config, source, placement, clip_skip)
            .map_err(|err| pipeline_error(err, placement.target))
    }

    fn release(&mut self, placement: &Placement) {
        device::release(&placement.device);
    }
}

/// One CLIP text encoder. Offloaded encoders are built on the CPU for each
/// encoding and dropped right after.
struct TextEncoder {
    tokenizer: Tokenizer,
    config: ClipConfig,
    pad_id: u32,
    weights: PathBuf,
    model: Option<ClipTextTransformer>,
}

impl TextEncoder {
    fn new(
        tokenizer: &Path,
        config: ClipConfig,
        weights: PathBuf,
        device: Option<&Device>,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer).map_err(E::msg)?;
        let pad = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad)
            .with_context(|| format!("tokenizer has no {pad} token"))?;
        let model = match device {
            Some(device) => {
                info!("Building the Clip transformer.");
                Some(build_clip_transformer(&config, &weights, device, DType::F32)?)
            }
            None => None,
        };
        Ok(Self {
            tokenizer,
            config,
            pad_id,
            weights,
            model,
        })
    }

    fn tokens(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        let max = self.config.max_position_embeddings;
        if tokens.len() > max {
            warn!("prompt is {} tokens long, truncating to {max}", tokens.len());
            tokens.truncate(max);
        }
        tokens.resize(max, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?)
    }

    /// Encodes the prompts and stacks them along the batch dimension.
    fn embed(&self, prompts: &[&str], device: &Device) -> Result<Tensor> {
        let cpu = Device::Cpu;
        let offloaded;
        let (model, device) = match &self.model {
            Some(model) => (model, device),
            None => {
                debug!("building the offloaded text encoder on CPU");
                offloaded = build_clip_transformer(&self.config, &self.weights, &cpu, DType::F32)?;
                (&offloaded, &cpu)
            }
        };
        let embeddings = prompts
            .iter()
            .map(|prompt| Ok(model.forward(&self.tokens(prompt, device)?)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&embeddings, 0)?)
    }
}

/// A loaded Stable Diffusion image-to-image pipeline.
pub struct StylePipeline {
    version: StableDiffusionVersion,
    sd_config: StableDiffusionConfig,
    device: Device,
    dtype: DType,
    target: ExecutionTarget,
    use_flash_attn: bool,
    encoders: Vec<TextEncoder>,
    /// Keyed by prompt, negative prompt and whether guidance is used.
    embeddings: HashMap<(String, String, bool), Tensor>,
    vae: AutoEncoderKL,
    posterior: PosteriorEncoder,
    unet: Option<UNet2DConditionModel>,
    unet_path: PathBuf,
    merges: usize,
    sampler: Sampler,
    workdir: TempDir,
}

impl StylePipeline {
    fn load(
        hub: &ModelHub,
        config: &RuntimeConfig,
        source: &ModelSource,
        placement: &Placement,
        clip_skip: usize,
    ) -> Result<Self> {
        let workdir = match &config.cache_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                tempfile::Builder::new().prefix("restyle-").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("restyle-").tempdir()?,
        };
        let device = placement.device.clone();
        let dtype = placement.dtype;
        let use_f16 = dtype == DType::F16;

        let (version, unet_path, vae_path, checkpoint_clip) = match source {
            ModelSource::Base => {
                let version = hub.base_version();
                info!(model = hub.base_model(), ?version, "loading the base model");
                let unet = ModelFile::Unet.get(hub, version, use_f16)?;
                let vae = ModelFile::Vae.get(hub, version, use_f16)?;
                (version, unet, vae, None)
            }
            ModelSource::Checkpoint(path) => {
                let converted = weights::convert_checkpoint(path, workdir.path())?;
                let version = converted.version;
                let vae = match converted.vae {
                    // The SDXL autoencoder overflows in f16, the fixed one is fetched instead.
                    Some(vae) if !(version == StableDiffusionVersion::Xl && use_f16) => vae,
                    _ => ModelFile::Vae.get(hub, version, use_f16)?,
                };
                (version, converted.unet, vae, converted.clip)
            }
        };

        let sliced = placement
            .memory
            .attention_slicing
            .then_some(AUTO_SLICE_SIZE);
        let sd_config = version.config(sliced);
        let encoder_device = (!placement.memory.cpu_offload).then_some(&device);

        let mut encoders = Vec::with_capacity(version.text_encoders());
        for index in 0..version.text_encoders() {
            let (tokenizer, clip_file, clip_config) = if index == 0 {
                (ModelFile::Tokenizer, ModelFile::Clip, sd_config.clip.clone())
            } else {
                let clip2 = sd_config
                    .clip2
                    .clone()
                    .context("no configuration for the second text encoder")?;
                (ModelFile::Tokenizer2, ModelFile::Clip2, clip2)
            };
            let tokenizer = tokenizer.get(hub, version, use_f16)?;
            let clip_weights = match (index, &checkpoint_clip) {
                (0, Some(path)) => path.clone(),
                _ => clip_file.get(hub, version, false)?,
            };
            let clip_weights = if clip_skip > 1 {
                let dst = workdir
                    .path()
                    .join(format!("text_encoder_{index}.skip{clip_skip}.safetensors"));
                weights::skip_clip_layers(&clip_weights, &dst, clip_skip)?;
                dst
            } else {
                clip_weights
            };
            encoders.push(TextEncoder::new(
                &tokenizer,
                clip_config,
                clip_weights,
                encoder_device,
            )?);
        }

        info!("Building the autoencoder.");
        let vae = sd_config.build_vae(&vae_path, &device, dtype)?;
        let vae_weights = unsafe { VarBuilder::from_mmaped_safetensors(&[&vae_path], dtype, &device) }
            .with_context(|| format!("mapping {}", vae_path.display()))?;
        let posterior = PosteriorEncoder::new(vae_weights, &EncoderConfig::default())?;

        let use_flash_attn =
            config.use_flash_attn && placement.target == ExecutionTarget::Accelerated;
        info!("Building the unet.");
        let unet = sd_config.build_unet(&unet_path, &device, 4, use_flash_attn, dtype)?;

        Ok(Self {
            version,
            sd_config,
            device,
            dtype,
            target: placement.target,
            use_flash_attn,
            encoders,
            embeddings: HashMap::new(),
            vae,
            posterior,
            unet: Some(unet),
            unet_path,
            merges: 0,
            sampler: Sampler::default(),
            workdir,
        })
    }

    fn build_unet(&self, path: &Path) -> Result<UNet2DConditionModel> {
        Ok(self
            .sd_config
            .build_unet(path, &self.device, 4, self.use_flash_attn, self.dtype)?)
    }

    fn merge_adapter(&mut self, path: &Path, strategy: MergeStrategy, scale: f64) -> Result<usize> {
        let adapter = LoraAdapter::load(path)?;
        self.merges += 1;
        let merged = self
            .workdir
            .path()
            .join(format!("unet.lora{}.safetensors", self.merges));
        let report = lora::merge_into(&adapter, &self.unet_path, &merged, strategy, scale)?;

        // Only one UNet is kept in memory at a time.
        self.unet = None;
        match self.build_unet(&merged) {
            Ok(unet) => {
                self.unet = Some(unet);
                self.unet_path = merged;
                Ok(report.applied)
            }
            Err(err) => {
                self.unet = Some(self.build_unet(&self.unet_path)?);
                Err(err.context("building the merged UNet"))
            }
        }
    }

    fn text_embeddings(&mut self, params: &GenerationParams) -> Result<Tensor> {
        let guided = params.uses_guidance();
        let key = (params.prompt.clone(), params.negative_prompt.clone(), guided);
        if let Some(embeddings) = self.embeddings.get(&key) {
            return Ok(embeddings.clone());
        }
        info!("Running with prompt \"{}\".", params.prompt);
        let prompts = if guided {
            vec![params.negative_prompt.as_str(), params.prompt.as_str()]
        } else {
            vec![params.prompt.as_str()]
        };
        let mut parts = Vec::with_capacity(self.encoders.len());
        for encoder in self.encoders.iter() {
            let embeddings = encoder.embed(&prompts, &self.device)?;
            parts.push(embeddings.to_device(&self.device)?);
        }
        let embeddings = Tensor::cat(&parts, D::Minus1)?.to_dtype(self.dtype)?;
        self.embeddings.insert(key, embeddings.clone());
        Ok(embeddings)
    }

    fn run(
        &mut self,
        image: &DynamicImage,
        plan: &VariantPlan,
        params: &GenerationParams,
        on_step: &mut dyn FnMut(usize, usize),
    ) -> Result<DynamicImage> {
        let text_embeddings = self.text_embeddings(params)?;
        let guided = params.uses_guidance();
        let latent_scale = self.version.latent_scale();

        let init = image_to_tensor(image)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let (latents, noise, mut source) = self.posterior.seeded_latents(&init, plan)?;
        let latents = (latents * latent_scale)?.to_dtype(DType::F32)?;

        let mut scheduler = self.sampler.build(params.steps, self.version.prediction_type());
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = params.start_step();
        let mut latents = if t_start < timesteps.len() {
            scheduler.add_noise(&latents, noise.to_dtype(DType::F32)?, t_start)?
        } else {
            latents
        };

        let unet = self.unet.as_ref().context("the UNet is not loaded")?;
        let total = timesteps.len().saturating_sub(t_start);
        debug!(variant = plan.index, t_start, total, sampler = %self.sampler, "starting sampling");
        for (done, step) in (t_start..timesteps.len()).enumerate() {
            let start_time = Instant::now();
            let timestep = timesteps[step];
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler
                .scale_model_input(input, step)?
                .to_dtype(self.dtype)?;
            let noise_pred = unet
                .forward(&input, timestep, &text_embeddings)?
                .to_dtype(DType::F32)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, step, &latents, &mut source)?;
            debug!(
                "step {}/{total} done, {:.2}s",
                done + 1,
                start_time.elapsed().as_secs_f32()
            );
            on_step(done + 1, total);
        }

        let image = self
            .vae
            .decode(&(latents / latent_scale)?.to_dtype(self.dtype)?)?;
        tensor_to_image(&image)
    }
}

impl Pipeline for StylePipeline {
    fn attach_adapter(
        &mut self,
        path: &Path,
        strategy: MergeStrategy,
        scale: f64,
    ) -> std::result::Result<usize, PipelineError> {
        self.merge_adapter(path, strategy, scale)
            .map_err(|err| pipeline_error(err, self.target))
    }

    fn set_sampler(&mut self, sampler: Sampler) {
        self.sampler = sampler;
    }

    fn generate(
        &mut self,
        image: &DynamicImage,
        plan: &VariantPlan,
        params: &GenerationParams,
        on_step: &mut dyn FnMut(usize, usize),
    ) -> std::result::Result<DynamicImage, PipelineError> {
        self.run(image, plan, params, on_step)
            .map_err(|err| pipeline_error(err, self.target))
    }
}
