use candle_core::{Result, Tensor};

use super::{alphas_cumprod, BetaSchedule, NoiseSource, PredictionType, Scheduler};

/// The solver type for the second-order solver.
/// The solver type slightly affects the sample quality, especially for
/// small number of steps.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DPMSolverType {
    #[default]
    Midpoint,
    Heun,
}

#[derive(Debug, Clone)]
pub struct DPMSolverMultistepSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// the order of DPM-Solver++, `1` or `2`. Second order is the usual choice
    /// for guided sampling.
    pub solver_order: usize,
    /// prediction type of the scheduler function
    pub prediction_type: PredictionType,
    /// The solver type for the second-order solver.
    pub solver_type: DPMSolverType,
    /// Whether to use lower-order solvers in the final steps. Only valid for < 15 inference steps.
    pub lower_order_final: bool,
}

impl Default for DPMSolverMultistepSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            solver_order: 2,
            prediction_type: PredictionType::Epsilon,
            solver_type: DPMSolverType::Midpoint,
            lower_order_final: true,
        }
    }
}

/// DPM-Solver++ multistep scheduler, https://arxiv.org/abs/2211.01095.
pub struct DPMSolverMultistepScheduler {
    alphas_cumprod: Vec<f64>,
    alpha_t: Vec<f64>,
    sigma_t: Vec<f64>,
    lambda_t: Vec<f64>,
    lower_order_nums: usize,
    model_outputs: Vec<Option<Tensor>>,
    timesteps: Vec<usize>,
    model_timesteps: Vec<f64>,
    pub config: DPMSolverMultistepSchedulerConfig,
}

impl DPMSolverMultistepScheduler {
    pub fn new(inference_steps: usize, config: DPMSolverMultistepSchedulerConfig) -> Self {
        let alphas_cumprod = alphas_cumprod(
            config.beta_schedule,
            config.beta_start,
            config.beta_end,
            config.train_timesteps,
        );
        let alpha_t: Vec<f64> = alphas_cumprod.iter().map(|ac| ac.sqrt()).collect();
        let sigma_t: Vec<f64> = alphas_cumprod.iter().map(|ac| (1. - ac).sqrt()).collect();
        let lambda_t = alpha_t
            .iter()
            .zip(sigma_t.iter())
            .map(|(a, s)| a.ln() - s.ln())
            .collect();

        let step = (config.train_timesteps - 1) as f64 / inference_steps as f64;
        // https://github.com/huggingface/diffusers/blob/e4fe9413121b78c4c1f109b50f0f3cc1c320a1a2/src/diffusers/schedulers/scheduling_dpmsolver_multistep.py#L199-L204
        let timesteps: Vec<usize> = (0..inference_steps + 1)
            .map(|i| (i as f64 * step).round() as usize)
            // discards the 0.0 element
            .skip(1)
            .rev()
            .collect();
        let model_timesteps = timesteps.iter().map(|&t| t as f64).collect();
        let model_outputs = vec![None; config.solver_order.max(1)];

        Self {
            alphas_cumprod,
            alpha_t,
            sigma_t,
            lambda_t,
            lower_order_nums: 0,
            model_outputs,
            timesteps,
            model_timesteps,
            config,
        }
    }

    /// Converts the model output to the data prediction DPM-Solver++ integrates.
    fn convert_model_output(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let alpha_t = self.alpha_t[timestep];
        let sigma_t = self.sigma_t[timestep];
        match self.config.prediction_type {
            PredictionType::Epsilon => (sample - (model_output * sigma_t)?)? / alpha_t,
            PredictionType::VPrediction => (sample * alpha_t)? - (model_output * sigma_t)?,
        }
    }

    ///  One step for the first-order DPM-Solver (equivalent to DDIM).
    ///  See https://arxiv.org/abs/2206.00927 for the detailed derivation.
    fn first_order_update(
        &self,
        model_output: &Tensor,
        timestep: usize,
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let (lambda_t, lambda_s) = (self.lambda_t[prev_timestep], self.lambda_t[timestep]);
        let alpha_t = self.alpha_t[prev_timestep];
        let (sigma_t, sigma_s) = (self.sigma_t[prev_timestep], self.sigma_t[timestep]);
        let h = lambda_t - lambda_s;
        (sample * (sigma_t / sigma_s))? - (model_output * (alpha_t * ((-h).exp() - 1.0)))?
    }

    ///  One step for the second-order multistep DPM-Solver.
    fn second_order_update(
        &self,
        m0: &Tensor,
        m1: &Tensor,
        timestep_list: [usize; 2],
        prev_timestep: usize,
        sample: &Tensor,
    ) -> Result<Tensor> {
        let (t, s0, s1) = (prev_timestep, timestep_list[1], timestep_list[0]);
        let (lambda_t, lambda_s0, lambda_s1) =
            (self.lambda_t[t], self.lambda_t[s0], self.lambda_t[s1]);
        let alpha_t = self.alpha_t[t];
        let (sigma_t, sigma_s0) = (self.sigma_t[t], self.sigma_t[s0]);
        let (h, h_0) = (lambda_t - lambda_s0, lambda_s0 - lambda_s1);
        let r0 = h_0 / h;
        let d0 = m0;
        let d1 = ((m0 - m1)? * (1.0 / r0))?;
        let base = ((sample * (sigma_t / sigma_s0))? - (d0 * (alpha_t * ((-h).exp() - 1.0)))?)?;
        // See https://arxiv.org/abs/2211.01095 for detailed derivations
        match self.config.solver_type {
            DPMSolverType::Midpoint => base - (d1 * (0.5 * alpha_t * ((-h).exp() - 1.0)))?,
            DPMSolverType::Heun => base + (d1 * (alpha_t * (((-h).exp() - 1.0) / h + 1.0)))?,
        }
    }
}

impl Scheduler for DPMSolverMultistepScheduler {
    fn timesteps(&self) -> &[f64] {
        self.model_timesteps.as_slice()
    }

    fn init_noise_sigma(&self) -> f64 {
        1.
    }

    fn scale_model_input(&self, sample: Tensor, _step: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step: usize,
        sample: &Tensor,
        _noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let timestep = self.timesteps[step];
        let last = step == self.timesteps.len() - 1;
        let prev_timestep = if last { 0 } else { self.timesteps[step + 1] };
        let lower_order_final = last && self.config.lower_order_final && self.timesteps.len() < 15;

        let model_output = self.convert_model_output(model_output, timestep, sample)?;
        self.model_outputs.rotate_left(1);
        let m = self.model_outputs.len();
        self.model_outputs[m - 1] = Some(model_output.clone());

        let previous = if m >= 2 { self.model_outputs[m - 2].clone() } else { None };
        let prev_sample = match previous {
            Some(m1) if self.lower_order_nums >= 1 && !lower_order_final && step >= 1 => {
                let timestep_list = [self.timesteps[step - 1], timestep];
                self.second_order_update(&model_output, &m1, timestep_list, prev_timestep, sample)?
            }
            _ => self.first_order_update(&model_output, timestep, prev_timestep, sample)?,
        };

        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }

        Ok(prev_sample)
    }

    fn add_noise(&self, original: &Tensor, noise: Tensor, step: usize) -> Result<Tensor> {
        let timestep = self.timesteps[step];
        (original * self.alphas_cumprod[timestep].sqrt())?
            + (noise * (1.0 - self.alphas_cumprod[timestep]).sqrt())?
    }
}
