//! Runs a style-transfer request end to end against a [`Backend`].
//!
//! The steps are strictly sequential: device selection, model load, optional
//! adapter, sampler, one generation per variant, optional upscaling. Whatever
//! happens, the pipeline is dropped and the device released before returning.
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use image::DynamicImage;
use tracing::{error, info, warn};

use crate::classify::ModelKind;
use crate::config::RuntimeConfig;
use crate::device::{select_device, AcceleratorProbe, DeviceSelection, ExecutionTarget, MemoryPlan};
use crate::lora::MergeStrategy;
use crate::progress::Progress;
use crate::request::{
    plan_variants, upscale, GenerationParams, GenerationRequest, GenerationResult, Variant,
    VariantPlan,
};
use crate::schedulers::Sampler;
use crate::utils::truncate;
use crate::{Error, Result};

/// What a pipeline is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// The configured base model, adapters are attached afterwards.
    Base,
    /// A single-file checkpoint.
    Checkpoint(PathBuf),
}

/// Where and how a pipeline runs.
#[derive(Debug, Clone)]
pub struct Placement {
    pub device: Device,
    pub target: ExecutionTarget,
    pub dtype: DType,
    pub memory: MemoryPlan,
}

impl Placement {
    pub fn new(selection: &DeviceSelection, config: &RuntimeConfig) -> Self {
        Self {
            device: selection.device.clone(),
            target: selection.target,
            dtype: selection.target.dtype(),
            memory: MemoryPlan::new(config, selection),
        }
    }

    pub fn cpu(config: &RuntimeConfig) -> Self {
        let target = ExecutionTarget::GeneralPurpose;
        Self {
            device: Device::Cpu,
            target,
            dtype: target.dtype(),
            memory: MemoryPlan::for_target(config, target, None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The accelerator failed, the same work may succeed on the CPU.
    #[error("accelerator error: {0}")]
    Accelerator(String),
    #[error("{0}")]
    Other(String),
}

/// A loaded image-to-image pipeline.
pub trait Pipeline {
    /// Merges an adapter into the pipeline and returns the number of layers it
    /// changed.
    fn attach_adapter(
        &mut self,
        path: &Path,
        strategy: MergeStrategy,
        scale: f64,
    ) -> std::result::Result<usize, PipelineError>;

    fn set_sampler(&mut self, sampler: Sampler);

    /// Generates one variant. `on_step` receives the completed and total
    /// denoising steps.
    fn generate(
        &mut self,
        image: &DynamicImage,
        plan: &VariantPlan,
        params: &GenerationParams,
        on_step: &mut dyn FnMut(usize, usize),
    ) -> std::result::Result<DynamicImage, PipelineError>;
}

pub trait Backend {
    type Pipeline: Pipeline;

    fn load(
        &mut self,
        source: &ModelSource,
        placement: &Placement,
        clip_skip: usize,
    ) -> std::result::Result<Self::Pipeline, PipelineError>;

    /// Returns memory held on the placement's device.
    fn release(&mut self, placement: &Placement);
}

/// Owns the pipeline for the duration of a request and releases the device
/// when dropped.
struct Session<'a, B: Backend> {
    backend: &'a mut B,
    placement: Placement,
    pipeline: Option<B::Pipeline>,
}

impl<B: Backend> Session<'_, B> {
    /// Loads the pipeline, retrying once on the CPU after an accelerator error.
    fn load(
        &mut self,
        source: &ModelSource,
        clip_skip: usize,
        config: &RuntimeConfig,
        messages: &mut Vec<String>,
    ) -> std::result::Result<(&Placement, &mut B::Pipeline), PipelineError> {
        let pipeline = match self.backend.load(source, &self.placement, clip_skip) {
            Ok(pipeline) => pipeline,
            Err(PipelineError::Accelerator(msg))
                if self.placement.target == ExecutionTarget::Accelerated =>
            {
                warn!("accelerator error while loading the model, retrying on CPU: {msg}");
                messages.push(format!(
                    "Accelerator error while loading the model, switching to CPU: {}",
                    truncate(&msg, 80)
                ));
                self.backend.release(&self.placement);
                self.placement = Placement::cpu(config);
                self.backend.load(source, &self.placement, clip_skip)?
            }
            Err(err) => return Err(err),
        };
        Ok((&self.placement, self.pipeline.insert(pipeline)))
    }
}

impl<B: Backend> Drop for Session<'_, B> {
    fn drop(&mut self) {
        self.pipeline.take();
        self.backend.release(&self.placement);
    }
}

/// Tries a strict merge, then a lenient one, then gives up on the adapter.
fn attach_adapter<P: Pipeline>(
    pipeline: &mut P,
    path: &Path,
    scale: f64,
    messages: &mut Vec<String>,
) {
    let strict_err = match pipeline.attach_adapter(path, MergeStrategy::Strict, scale) {
        Ok(layers) => {
            info!(layers, "LoRA adapter applied");
            return;
        }
        Err(err) => err,
    };
    info!("strict LoRA merge failed, retrying leniently: {strict_err}");
    match pipeline.attach_adapter(path, MergeStrategy::Lenient, scale) {
        Ok(layers) => messages.push(format!(
            "LoRA adapter applied partially ({layers} layers): {strict_err}"
        )),
        Err(err) => {
            warn!("LoRA adapter could not be applied: {err}");
            messages.push(format!(
                "Could not load the LoRA adapter, continuing without it: {err}"
            ));
        }
    }
}

/// Applies the style of `request.model` to `request.image`.
///
/// Variant and upscaling failures do not fail the request, they are reported
/// in [`GenerationResult::messages`]. A request where every variant failed
/// returns no images.
pub fn apply_style<B: Backend>(
    backend: &mut B,
    request: &GenerationRequest,
    config: &RuntimeConfig,
    probe: &dyn AcceleratorProbe,
    progress: &mut dyn Progress,
) -> Result<GenerationResult> {
    let params = &request.params;
    params.validate()?;
    let model = &request.model;
    let source = match model.kind {
        ModelKind::LoraAdapter => ModelSource::Base,
        ModelKind::FullCheckpoint => ModelSource::Checkpoint(model.path.clone()),
        ModelKind::Unknown => return Err(Error::UnsupportedModel(model.path.clone())),
    };
    progress.report(0.05, Some(&format!("Model type: {}", model.kind)));

    let mut messages = Vec::new();
    let selection = select_device(config.force_cpu, probe);
    info!(device = %selection.target, reason = %selection.reason, "device selected");
    if selection.degraded {
        messages.push(selection.reason.clone());
    }
    progress.report(0.1, Some(&format!("Device: {}", selection.reason)));

    let placement = Placement::new(&selection, config);
    info!(memory = ?placement.memory, dtype = ?placement.dtype, "memory plan");
    backend.release(&placement);
    let mut session = Session {
        backend,
        placement,
        pipeline: None,
    };

    progress.report(0.2, Some("Loading model"));
    let (placement, pipeline) = session
        .load(&source, params.clip_skip, config, &mut messages)
        .map_err(|err| match &source {
            ModelSource::Base => Error::BaseModelLoad {
                model: config.base_model.clone(),
                reason: err.to_string(),
            },
            ModelSource::Checkpoint(path) => Error::CheckpointLoad {
                path: path.clone(),
                reason: err.to_string(),
            },
        })?;
    let target = placement.target;
    let device_reason = if target == selection.target {
        selection.reason.clone()
    } else {
        format!("CPU after an accelerator error on {}", selection.reason)
    };

    match source {
        ModelSource::Base => {
            progress.report(0.4, Some("Applying LoRA adapter"));
            attach_adapter(pipeline, &model.path, params.adapter_scale, &mut messages);
            progress.report(0.5, None);
        }
        ModelSource::Checkpoint(_) => progress.report(0.5, None),
    }

    pipeline.set_sampler(params.sampler);
    let n = params.num_images;
    progress.report(0.6, Some(&format!("Generating {n} variant(s)")));

    let mut variants = Vec::with_capacity(n);
    for plan in plan_variants(params, &mut rand::thread_rng()) {
        let i = plan.index;
        let mut on_step = |step: usize, total: usize| {
            let fraction = 0.6
                + (i as f64 / n as f64) * 0.25
                + (step as f64 / total.max(1) as f64) * (0.25 / n as f64);
            progress.report(fraction, None);
        };
        match pipeline.generate(&request.image, &plan, params, &mut on_step) {
            Ok(image) => variants.push(Variant {
                index: i,
                seed: plan.seed,
                image,
            }),
            Err(err) => {
                error!(variant = i, "generation failed: {err}");
                messages.push(format!("Variant {} failed: {err}", i + 1));
            }
        }
    }
    progress.report(0.85, Some("Generation finished"));

    if params.upscale_factor > 1 && !variants.is_empty() {
        progress.report(0.9, Some("Upscaling"));
        let len = variants.len();
        for (k, variant) in variants.iter_mut().enumerate() {
            match upscale(&variant.image, params.upscale_factor) {
                Ok(image) => variant.image = image,
                Err(err) => {
                    warn!(variant = variant.index, "upscaling failed: {err}");
                    messages.push(format!(
                        "Upscaling variant {} failed, keeping the original size: {err}",
                        variant.index + 1
                    ));
                }
            }
            progress.report(0.9 + (k as f64 / len as f64) * 0.05, None);
        }
    }
    drop(session);

    if variants.is_empty() {
        messages.push("No variant could be generated".to_string());
    }
    progress.report(1.0, Some("Done"));
    Ok(GenerationResult {
        variants,
        messages,
        device_reason,
        target,
    })
}
