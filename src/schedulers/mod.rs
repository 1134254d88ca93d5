//! # Noise schedulers
//!
//! The sampler decides how the denoising loop walks from a noised latent back
//! to an image. It can be swapped without touching the model weights.
//!
//! Every scheduler addresses its steps by index into [`Scheduler::timesteps`],
//! and all the randomness they need is drawn from a [`NoiseSource`] so that a
//! fixed seed reproduces the same latents whatever the device.
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub mod ddim;
pub mod dpmsolver_multistep;
pub mod euler_ancestral_discrete;
pub mod euler_discrete;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Interface shared by the samplers used in the denoising loop.
pub trait Scheduler {
    /// The model timesteps, in the order they are visited.
    fn timesteps(&self) -> &[f64];

    /// Standard deviation of the initial noise distribution.
    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor, step: usize) -> Result<Tensor>;

    /// Performs the backward step at index `step`.
    fn step(
        &mut self,
        model_output: &Tensor,
        step: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor>;

    /// Noises `original` to the level expected at index `step`.
    fn add_noise(&self, original: &Tensor, noise: Tensor, step: usize) -> Result<Tensor>;
}

/// The sampler picked by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sampler {
    #[default]
    DpmSolverMultistep,
    EulerDiscrete,
    EulerAncestralDiscrete,
    Ddim,
}

impl Sampler {
    pub const ALL: [Sampler; 4] = [
        Self::DpmSolverMultistep,
        Self::EulerDiscrete,
        Self::EulerAncestralDiscrete,
        Self::Ddim,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::DpmSolverMultistep => "dpm-solver-multistep",
            Self::EulerDiscrete => "euler",
            Self::EulerAncestralDiscrete => "euler-ancestral",
            Self::Ddim => "ddim",
        }
    }

    /// The class name diffusers uses for the same scheduler.
    pub fn diffusers_name(&self) -> &'static str {
        match self {
            Self::DpmSolverMultistep => "DPMSolverMultistepScheduler",
            Self::EulerDiscrete => "EulerDiscreteScheduler",
            Self::EulerAncestralDiscrete => "EulerAncestralDiscreteScheduler",
            Self::Ddim => "DDIMScheduler",
        }
    }

    /// Builds a scheduler for `inference_steps` steps.
    pub fn build(
        &self,
        inference_steps: usize,
        prediction_type: PredictionType,
    ) -> Box<dyn Scheduler> {
        match self {
            Self::DpmSolverMultistep => {
                let config = dpmsolver_multistep::DPMSolverMultistepSchedulerConfig {
                    prediction_type,
                    ..Default::default()
                };
                Box::new(dpmsolver_multistep::DPMSolverMultistepScheduler::new(
                    inference_steps,
                    config,
                ))
            }
            Self::EulerDiscrete => {
                let config = euler_discrete::EulerDiscreteSchedulerConfig {
                    prediction_type,
                    ..Default::default()
                };
                Box::new(euler_discrete::EulerDiscreteScheduler::new(
                    inference_steps,
                    config,
                ))
            }
            Self::EulerAncestralDiscrete => {
                let config = euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig {
                    prediction_type,
                    ..Default::default()
                };
                Box::new(euler_ancestral_discrete::EulerAncestralDiscreteScheduler::new(
                    inference_steps,
                    config,
                ))
            }
            Self::Ddim => {
                let config = ddim::DDIMSchedulerConfig {
                    prediction_type,
                    ..Default::default()
                };
                Box::new(ddim::DDIMScheduler::new(inference_steps, config))
            }
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Sampler {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sampler| {
                s.eq_ignore_ascii_case(sampler.name())
                    || s.eq_ignore_ascii_case(sampler.diffusers_name())
            })
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|s| s.name()).collect();
                format!("unknown sampler {s:?}, expected one of {}", known.join(", "))
            })
    }
}

/// Seeded source of standard normal noise.
///
/// Samples are drawn on the CPU and then moved to the target device, the CPU
/// backend of candle cannot be seeded.
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu)?.to_device(device)
    }

    pub fn randn_like(&mut self, tensor: &Tensor) -> Result<Tensor> {
        self.randn(tensor.shape().clone(), tensor.device())?
            .to_dtype(tensor.dtype())
    }
}

/// Spherical interpolation between two noise tensors, `t = 0` gives `from`.
pub fn slerp(t: f64, from: &Tensor, to: &Tensor) -> Result<Tensor> {
    let dtype = from.dtype();
    let a = from.to_dtype(DType::F32)?;
    let b = to.to_dtype(DType::F32)?;
    let a_norm = a.broadcast_div(&a.sqr()?.sum_all()?.sqrt()?)?;
    let b_norm = b.broadcast_div(&b.sqr()?.sum_all()?.sqrt()?)?;
    let dot = (a_norm * b_norm)?.sum_all()?.to_scalar::<f32>()? as f64;
    let mixed = if dot.abs() > 0.9995 {
        ((&a * (1. - t))? + (&b * t)?)?
    } else {
        let omega = dot.clamp(-1., 1.).acos();
        let so = omega.sin();
        ((&a * (((1. - t) * omega).sin() / so))? + (&b * ((t * omega).sin() / so))?)?
    };
    mixed.to_dtype(dtype)
}

pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Cumulative product of `1 - beta` over the training timesteps.
pub(crate) fn alphas_cumprod(
    schedule: BetaSchedule,
    beta_start: f64,
    beta_end: f64,
    train_timesteps: usize,
) -> Vec<f64> {
    let betas = match schedule {
        BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), train_timesteps)
            .into_iter()
            .map(|b| b * b)
            .collect::<Vec<_>>(),
        BetaSchedule::Linear => linspace(beta_start, beta_end, train_timesteps),
    };
    let mut acc = 1.0;
    betas
        .iter()
        .map(|beta| {
            acc *= 1.0 - beta;
            acc
        })
        .collect()
}

/// One-dimensional linear interpolation for monotonically increasing sample
/// points, mimicking np.interp().
pub(crate) fn interp(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    x.iter()
        .map(|&v| {
            if v <= xp[0] {
                return fp[0];
            }
            let last = xp.len() - 1;
            if v >= xp[last] {
                return fp[last];
            }
            let j = xp.partition_point(|&p| p <= v) - 1;
            let w = (v - xp[j]) / (xp[j + 1] - xp[j]);
            fp[j] + w * (fp[j + 1] - fp[j])
        })
        .collect()
}

/// Sigma table used by the Euler family: one sigma per timestep plus a final zero.
pub(crate) fn discrete_sigmas(
    timesteps: &[f64],
    alphas_cumprod: &[f64],
) -> Vec<f64> {
    let sigmas: Vec<f64> = alphas_cumprod
        .iter()
        .map(|ac| ((1. - ac) / ac).sqrt())
        .collect();
    let positions: Vec<f64> = (0..sigmas.len()).map(|i| i as f64).collect();
    let mut sigmas = interp(timesteps, &positions, &sigmas);
    sigmas.push(0.0);
    sigmas
}
