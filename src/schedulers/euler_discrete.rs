use candle_core::{Result, Tensor};

use super::{
    alphas_cumprod, discrete_sigmas, linspace, BetaSchedule, NoiseSource, PredictionType,
    Scheduler,
};

#[derive(Debug, Clone)]
pub struct EulerDiscreteSchedulerConfig {
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

impl Default for EulerDiscreteSchedulerConfig {
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

/// Euler scheduler (Algorithm 2) from Karras et al. (2022) https://arxiv.org/abs/2206.00364.
/// Based on the original
/// k-diffusion implementation by Katherine Crowson:
/// https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
    pub config: EulerDiscreteSchedulerConfig,
}

impl EulerDiscreteScheduler {
    pub fn new(inference_steps: usize, config: EulerDiscreteSchedulerConfig) -> Self {
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

impl Scheduler for EulerDiscreteScheduler {
    fn timesteps(&self) -> &[f64] {
        self.timesteps.as_slice()
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor, step: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step];
        // https://github.com/huggingface/diffusers/blob/2bd53a940c60d13421d9e8887af96b30a53c1b95/src/diffusers/schedulers/scheduling_euler_discrete.py#L133
        sample / (sigma.powi(2) + 1.).sqrt()
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step: usize,
        sample: &Tensor,
        _noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        // s_churn is 0 so sigma_hat is sigma and no noise is injected.
        let sigma = self.sigmas[step];

        // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => (sample - (model_output * sigma)?)?,
            PredictionType::VPrediction => ((model_output
                * (-sigma / (sigma.powi(2) + 1.).sqrt()))?
                + (sample / (sigma.powi(2) + 1.))?)?,
        };

        // 2. Convert to an ODE derivative
        let derivative = ((sample - pred_original_sample)? / sigma)?;
        let dt = self.sigmas[step + 1] - sigma;

        sample + (derivative * dt)?
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, step: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step];
        original + (noise * sigma)?
    }
}
