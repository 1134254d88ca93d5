use candle_core::{Result, Tensor};

use super::{
    alphas_cumprod, discrete_sigmas, linspace, BetaSchedule, NoiseSource, PredictionType,
    Scheduler,
};

#[derive(Debug, Clone)]
pub struct EulerAncestralDiscreteSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
}

impl Default for EulerAncestralDiscreteSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

/// Ancestral sampling with Euler method steps.
/// Based on the original k-diffusion implementation by Katherine Crowson:
///
/// https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
#[derive(Debug, Clone)]
pub struct EulerAncestralDiscreteScheduler {
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    pub config: EulerAncestralDiscreteSchedulerConfig,
}

impl EulerAncestralDiscreteScheduler {
    pub fn new(inference_steps: usize, config: EulerAncestralDiscreteSchedulerConfig) -> Self {
        let alphas_cumprod = alphas_cumprod(
            config.beta_schedule,
            config.beta_start,
            config.beta_end,
            config.train_timesteps,
        );
        let timesteps = linspace((config.train_timesteps - 1) as f64, 0., inference_steps);
        let sigmas = discrete_sigmas(&timesteps, &alphas_cumprod);
        let init_noise_sigma = sigmas.iter().cloned().fold(0., f64::max);
        Self {
            timesteps,
            sigmas,
            init_noise_sigma,
            config,
        }
    }
}

impl Scheduler for EulerAncestralDiscreteScheduler {
    fn timesteps(&self) -> &[f64] {
        self.timesteps.as_slice()
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor, step: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step];
        // https://github.com/huggingface/diffusers/blob/aba2a65d6ab47c0d1c12fa47e9b238c1d3e34512/src/diffusers/schedulers/scheduling_euler_ancestral_discrete.py#L132
        sample / (sigma.powi(2) + 1.).sqrt()
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let sigma = self.sigmas[step];

        // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => (sample - (model_output * sigma)?)?,
            PredictionType::VPrediction => ((model_output
                * (-sigma / (sigma.powi(2) + 1.).sqrt()))?
                + (sample / (sigma.powi(2) + 1.))?)?,
        };

        let sigma_from = sigma;
        let sigma_to = self.sigmas[step + 1];
        let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2))
            / sigma_from.powi(2))
        .sqrt();
        let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

        // 2. Convert to an ODE derivative
        let derivative = ((sample - pred_original_sample)? / sigma)?;
        let dt = sigma_down - sigma;

        let prev_sample = (sample + (derivative * dt)?)?;
        let eps = noise.randn_like(model_output)?;

        prev_sample + (eps * sigma_up)?
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, step: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step];
        original + (noise * sigma)?
    }
}
