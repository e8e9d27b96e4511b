use super::{Conditioning, NoisePredictor};
use crate::error::{Result, SyncError};
use crate::schedule::NoiseSchedule;
use candle_core::Tensor;

/// Predicts exactly the noise that separates `x_t` from a known clean image.
///
/// With a perfect predictor the Tweedie estimate of every view is its
/// target, which makes the sampler's output checkable.
pub struct OracleNoisePredictor {
    /// Clean target per view, unbatched.
    targets: Vec<Tensor>,
    schedule: NoiseSchedule,
}

impl OracleNoisePredictor {
    pub fn new(targets: Vec<Tensor>, schedule: NoiseSchedule) -> Self {
        Self { targets, schedule }
    }
}

impl NoisePredictor for OracleNoisePredictor {
    fn predict_noise(&self, samples: &Tensor, timestep: usize, conditioning: &Conditioning) -> Result<Tensor> {
        let targets = conditioning
            .view_ids
            .iter()
            .map(|&v| {
                self.targets.get(v).cloned().ok_or(SyncError::ViewCountMismatch {
                    views: self.targets.len(),
                    estimates: v + 1,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let targets = Tensor::stack(&targets, 0)?.to_dtype(samples.dtype())?;
        if targets.dims() != samples.dims() {
            return Err(SyncError::ShapeMismatch {
                expected: samples.dims().to_vec(),
                actual: targets.dims().to_vec(),
            });
        }
        let (sqrt_alpha, sqrt_one_minus_alpha) = self.schedule.coefficients(timestep)?;
        Ok((samples - targets.affine(sqrt_alpha, 0.0)?)?.affine(1.0 / sqrt_one_minus_alpha, 0.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleConfig;
    use crate::tweedie::estimate_clean;
    use candle_core::Device;

    #[test]
    fn test_oracle_recovers_targets() -> Result<()> {
        let device = Device::Cpu;
        let schedule = NoiseSchedule::new(&ScheduleConfig::stable_diffusion(), 10)?;
        let targets = vec![
            Tensor::randn(0f32, 1f32, (4, 4, 4), &device)?,
            Tensor::randn(0f32, 1f32, (4, 4, 4), &device)?,
        ];
        let oracle = OracleNoisePredictor::new(targets.clone(), schedule.clone());

        // Samples in reverse view order to exercise the lookup.
        let x_t = Tensor::randn(0f32, 1f32, (2, 4, 4, 4), &device)?;
        let cond = Conditioning {
            prompt_ids: vec![1, 1],
            view_ids: vec![1, 0],
        };
        let eps = oracle.predict_noise(&x_t, 500, &cond)?;
        let x0 = estimate_clean(&x_t, &eps, 500, &schedule)?;
        let expected = Tensor::stack(&[&targets[1], &targets[0]], 0)?;
        let diff = (x0 - expected)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }
}
