//! Request parameters, variant seeding and result post-processing.
use std::io::Cursor;

use candle_core::{Device, Shape, Tensor};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use rand::Rng;

use crate::classify::ModelReference;
use crate::device::ExecutionTarget;
use crate::schedulers::{slerp, NoiseSource, Sampler};
use crate::{Error, Result};

/// Seeds are kept within the range of a signed 32-bit integer.
pub const MAX_SEED: u64 = 2_147_483_647;

const MAX_STEPS: usize = 1000;

pub const MAX_UPSCALE_FACTOR: u32 = 4;

/// Upscaled outputs larger than this are refused, 8192 x 8192.
const MAX_UPSCALED_PIXELS: u64 = 1 << 26;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// How far the source image is noised, in (0, 1].
    pub strength: f64,
    pub guidance_scale: f64,
    pub steps: usize,
    pub clip_skip: usize,
    pub sampler: Sampler,
    pub seed: Option<u64>,
    pub variance_seed: Option<u64>,
    pub variance_strength: Option<f64>,
    pub num_images: usize,
    pub upscale_factor: u32,
    pub prompt: String,
    pub negative_prompt: String,
    pub adapter_scale: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            strength: 0.6,
            guidance_scale: 7.5,
            steps: 20,
            clip_skip: 2,
            sampler: Sampler::default(),
            seed: None,
            variance_seed: None,
            variance_strength: None,
            num_images: 1,
            upscale_factor: 1,
            prompt: String::new(),
            negative_prompt: String::new(),
            adapter_scale: 1.0,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidParameter(msg));
        if !(self.strength > 0. && self.strength <= 1.) {
            return invalid(format!("strength must be in (0, 1], got {}", self.strength));
        }
        if !(self.guidance_scale >= 0.) || !self.guidance_scale.is_finite() {
            return invalid(format!(
                "guidance scale must be non-negative, got {}",
                self.guidance_scale
            ));
        }
        if !(1..=MAX_STEPS).contains(&self.steps) {
            return invalid(format!(
                "steps must be between 1 and {MAX_STEPS}, got {}",
                self.steps
            ));
        }
        if self.clip_skip < 1 {
            return invalid("clip skip must be at least 1".to_string());
        }
        if self.num_images < 1 {
            return invalid("at least one image must be requested".to_string());
        }
        if !(1..=MAX_UPSCALE_FACTOR).contains(&self.upscale_factor) {
            return invalid(format!(
                "upscale factor must be between 1 and {MAX_UPSCALE_FACTOR}, got {}",
                self.upscale_factor
            ));
        }
        for (name, seed) in [("seed", self.seed), ("variance seed", self.variance_seed)] {
            if seed.is_some_and(|seed| seed > MAX_SEED) {
                return invalid(format!("{name} must be at most {MAX_SEED}"));
            }
        }
        if let Some(strength) = self.variance_strength {
            if !(0. ..=1.).contains(&strength) {
                return invalid(format!(
                    "variance strength must be in [0, 1], got {strength}"
                ));
            }
        }
        if !self.adapter_scale.is_finite() {
            return invalid("adapter scale must be finite".to_string());
        }
        Ok(())
    }

    /// Classifier-free guidance only pays off above a scale of 1.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.
    }

    /// Index of the first denoising step, the source image is noised to this
    /// step and the steps before it are skipped.
    pub fn start_step(&self) -> usize {
        let noised = (self.steps as f64 * self.strength).floor() as usize;
        self.steps - noised.min(self.steps)
    }
}

/// Seed of variant `index`. The first variant always uses the base seed.
pub fn variant_seed(seed: Option<u64>, variance_seed: Option<u64>, index: usize) -> Option<u64> {
    let seed = seed?;
    match variance_seed {
        Some(variance_seed) if index > 0 => {
            Some(seed + variance_seed.wrapping_mul(index as u64) % MAX_SEED)
        }
        _ => Some(seed),
    }
}

/// Blend of the base seed's noise into a variant's own noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseBlend {
    pub base_seed: u64,
    pub strength: f64,
}

/// How the noise of one variant is drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantPlan {
    pub index: usize,
    /// Reported seed, only when seeding was requested.
    pub seed: Option<u64>,
    /// Seed of the random generator driving the variant.
    pub noise_seed: u64,
    pub blend: Option<NoiseBlend>,
}

impl VariantPlan {
    /// Draws the initial noise of the variant. The returned source keeps
    /// supplying the sampler.
    pub fn initial_noise<S: Into<Shape>>(
        &self,
        shape: S,
        device: &Device,
    ) -> candle_core::Result<(Tensor, NoiseSource)> {
        let shape = shape.into();
        let mut source = NoiseSource::new(self.noise_seed);
        let own = source.randn(shape.clone(), device)?;
        let noise = match self.blend {
            Some(blend) => {
                let base = NoiseSource::new(blend.base_seed).randn(shape, device)?;
                slerp(blend.strength, &base, &own)?
            }
            None => own,
        };
        Ok((noise, source))
    }
}

/// Plans every variant of a request. `rng` only supplies seeds for unseeded
/// requests.
pub fn plan_variants(params: &GenerationParams, rng: &mut impl Rng) -> Vec<VariantPlan> {
    (0..params.num_images)
        .map(|index| {
            let seed = variant_seed(params.seed, params.variance_seed, index);
            let blend = match (params.seed, params.variance_seed, params.variance_strength) {
                (Some(base_seed), Some(_), Some(strength)) if index > 0 => Some(NoiseBlend {
                    base_seed,
                    strength,
                }),
                _ => None,
            };
            VariantPlan {
                index,
                seed,
                noise_seed: seed.unwrap_or_else(|| rng.gen_range(0..=MAX_SEED)),
                blend,
            }
        })
        .collect()
}

pub struct GenerationRequest {
    pub image: DynamicImage,
    pub model: ModelReference,
    pub params: GenerationParams,
}

#[derive(Debug, Clone)]
pub struct Variant {
    pub index: usize,
    pub seed: Option<u64>,
    pub image: DynamicImage,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub variants: Vec<Variant>,
    /// Warnings for the user, in the order they were raised.
    pub messages: Vec<String>,
    pub device_reason: String,
    pub target: ExecutionTarget,
}

/// Resizes by an integer factor with a Lanczos filter.
pub fn upscale(image: &DynamicImage, factor: u32) -> Result<DynamicImage> {
    if factor == 1 {
        return Ok(image.clone());
    }
    let (width, height) = match (
        image.width().checked_mul(factor),
        image.height().checked_mul(factor),
    ) {
        (Some(width), Some(height)) => (width, height),
        _ => {
            return Err(Error::InvalidParameter(format!(
                "upscaling {}x{} by {factor} overflows",
                image.width(),
                image.height()
            )))
        }
    };
    if u64::from(width) * u64::from(height) > MAX_UPSCALED_PIXELS {
        return Err(Error::InvalidParameter(format!(
            "upscaled image of {width}x{height} is too large"
        )));
    }
    Ok(image.resize_exact(width, height, FilterType::Lanczos3))
}

/// Encodes an image as PNG, for callers that hand results out as bytes.
pub fn to_png_bytes(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
