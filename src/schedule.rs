use crate::error::{Result, SyncError};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How beta moves from `beta_start` to `beta_end` over training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    /// Linear in sqrt(beta); the Stable Diffusion schedule.
    ScaledLinear,
    /// Glide cosine schedule, used by DeepFloyd IF.
    SquaredcosCapV2,
}

/// Training-time schedule parameters, field-compatible with a diffusers
/// `scheduler_config.json` (unknown fields are ignored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
}

fn default_beta_start() -> f64 {
    0.0001
}

fn default_beta_end() -> f64 {
    0.02
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::Linear
}

fn default_train_timesteps() -> usize {
    1000
}

impl ScheduleConfig {
    pub fn stable_diffusion() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            num_train_timesteps: 1000,
        }
    }

    pub fn deepfloyd() -> Self {
        Self {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::SquaredcosCapV2,
            num_train_timesteps: 1000,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn betas(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let lerp = |start: f64, end: f64, i: usize| {
            if n <= 1 {
                start
            } else {
                start + (end - start) * (i as f64 / (n - 1) as f64)
            }
        };
        match self.beta_schedule {
            BetaSchedule::Linear => (0..n).map(|i| lerp(self.beta_start, self.beta_end, i)).collect(),
            BetaSchedule::ScaledLinear => (0..n)
                .map(|i| lerp(self.beta_start.sqrt(), self.beta_end.sqrt(), i).powi(2))
                .collect(),
            BetaSchedule::SquaredcosCapV2 => {
                let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        }
    }
}

/// Precomputed cumulative-alpha tables and the deterministic DDIM reverse step.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    num_train_timesteps: usize,
    step_size: usize,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
}

impl NoiseSchedule {
    /// Builds the schedule from a beta schedule config.
    pub fn new(config: &ScheduleConfig, num_inference_steps: usize) -> Result<Self> {
        if config.num_train_timesteps == 0 {
            return Err(SyncError::InvalidSchedule(
                "num_train_timesteps must be positive".to_string(),
            ));
        }
        let mut alphas_cumprod = Vec::with_capacity(config.num_train_timesteps);
        let mut cum_prod = 1.0f64;
        for b in config.betas() {
            cum_prod *= 1.0 - b;
            alphas_cumprod.push(cum_prod);
        }
        Self::from_alphas_cumprod(alphas_cumprod, num_inference_steps)
    }

    /// Builds the schedule from an externally supplied cumulative-alpha table.
    pub fn from_alphas_cumprod(alphas_cumprod: Vec<f64>, num_inference_steps: usize) -> Result<Self> {
        let num_train_timesteps = alphas_cumprod.len();
        if num_inference_steps == 0 || num_inference_steps > num_train_timesteps {
            return Err(SyncError::InvalidSchedule(format!(
                "num_inference_steps must be in 1..={num_train_timesteps}, got {num_inference_steps}"
            )));
        }
        for (t, &a) in alphas_cumprod.iter().enumerate() {
            // a == 1 is only allowed at t = 0, which never divides by 1 - a.
            let valid = a.is_finite() && a > 0.0 && (a < 1.0 || (t == 0 && a <= 1.0));
            if !valid {
                return Err(SyncError::InvalidSchedule(format!(
                    "alphas_cumprod[{t}] = {a} is outside (0, 1)"
                )));
            }
        }

        let step_size = num_train_timesteps / num_inference_steps;
        let timesteps: Vec<usize> = (0..num_inference_steps).map(|i| i * step_size).rev().collect();
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            num_train_timesteps,
            step_size,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            timesteps,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }

    /// Visited timesteps, strictly decreasing and ending at 0.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn check(&self, timestep: usize) -> Result<()> {
        if timestep >= self.num_train_timesteps {
            return Err(SyncError::TimestepOutOfRange {
                timestep,
                num_train_timesteps: self.num_train_timesteps,
            });
        }
        Ok(())
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> Result<f64> {
        self.check(timestep)?;
        Ok(self.alphas_cumprod[timestep])
    }

    /// `(sqrt(alpha_cumprod[t]), sqrt(1 - alpha_cumprod[t]))`.
    pub fn coefficients(&self, timestep: usize) -> Result<(f64, f64)> {
        self.check(timestep)?;
        Ok((
            self.sqrt_alphas_cumprod[timestep],
            self.sqrt_one_minus_alphas_cumprod[timestep],
        ))
    }

    pub fn previous_timestep(&self, timestep: usize) -> usize {
        timestep.saturating_sub(self.step_size)
    }

    /// Deterministic DDIM update from `x_t` towards `x_0`:
    /// `sqrt(a_prev) * x0 + sqrt((1 - a_prev) / (1 - a_t)) * (x_t - sqrt(a_t) * x0)`.
    ///
    /// At `t == 0` the clean estimate is returned as is; both alphas
    /// may be 1 there and the ratio above would be 0/0.
    pub fn previous_sample(&self, x_t: &Tensor, x0: &Tensor, timestep: usize) -> Result<Tensor> {
        self.check(timestep)?;
        if timestep == 0 {
            return Ok(x0.clone());
        }
        let alpha_t = self.alphas_cumprod[timestep];
        let alpha_prev = self.alphas_cumprod[self.previous_timestep(timestep)];

        let direction = (x_t - x0.affine(alpha_t.sqrt(), 0.0)?)?;
        let dir_coeff = ((1.0 - alpha_prev) / (1.0 - alpha_t)).sqrt();
        Ok((x0.affine(alpha_prev.sqrt(), 0.0)? + direction.affine(dir_coeff, 0.0)?)?)
    }

    /// Forward noising: `sqrt(a_t) * x0 + sqrt(1 - a_t) * eps`.
    pub fn add_noise(&self, x0: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus_alpha) = self.coefficients(timestep)?;
        Ok((x0.affine(sqrt_alpha, 0.0)? + noise.affine(sqrt_one_minus_alpha, 0.0)?)?)
    }
}
