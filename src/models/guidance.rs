//! Classifier-free guidance around any noise predictor.

use super::{Conditioning, NoisePredictor};
use crate::error::Result;
use candle_core::Tensor;

/// Runs the inner predictor on the conditional and the empty-prompt batch
/// in one call and returns `uncond + scale * (cond - uncond)`.
pub struct ClassifierFreeGuidance<P> {
    inner: P,
    scale: f64,
}

impl<P: NoisePredictor> ClassifierFreeGuidance<P> {
    pub fn new(inner: P, scale: f64) -> Self {
        Self { inner, scale }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

/// `uncond + scale * (cond - uncond)`
pub fn apply_guidance(uncond: &Tensor, cond: &Tensor, scale: f64) -> Result<Tensor> {
    Ok((uncond + (cond - uncond)?.affine(scale, 0.0)?)?)
}

impl<P: NoisePredictor> NoisePredictor for ClassifierFreeGuidance<P> {
    fn predict_noise(&self, samples: &Tensor, timestep: usize, conditioning: &Conditioning) -> Result<Tensor> {
        // Guidance at or below 1 never needs the unconditional branch.
        if self.scale <= 1.0 {
            return self.inner.predict_noise(samples, timestep, conditioning);
        }
        let batch = samples.dim(0)?;
        let doubled = Tensor::cat(&[samples, samples], 0)?;
        let both = conditioning.unconditional().concat(conditioning);
        let eps = self.inner.predict_noise(&doubled, timestep, &both)?;
        let uncond = eps.narrow(0, 0, batch)?;
        let cond = eps.narrow(0, batch, batch)?;
        apply_guidance(&uncond, &cond, self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NULL_PROMPT;
    use candle_core::{D, Device};
    use std::sync::Mutex;

    /// Predicts the prompt slot id everywhere and records batch sizes.
    struct PromptEcho {
        calls: Mutex<Vec<usize>>,
    }

    impl NoisePredictor for PromptEcho {
        fn predict_noise(&self, samples: &Tensor, _timestep: usize, conditioning: &Conditioning) -> Result<Tensor> {
            self.calls.lock().unwrap().push(samples.dim(0)?);
            let ids: Vec<f32> = conditioning.prompt_ids.iter().map(|&p| p as f32).collect();
            let ids = Tensor::from_vec(ids, (conditioning.len(), 1, 1, 1), samples.device())?;
            Ok(ids.broadcast_as(samples.shape())?.contiguous()?)
        }
    }

    #[test]
    fn test_guided_prediction() -> Result<()> {
        let device = Device::Cpu;
        let guided = ClassifierFreeGuidance::new(
            PromptEcho {
                calls: Mutex::new(Vec::new()),
            },
            7.5,
        );
        let x = Tensor::zeros((2, 3, 2, 2), candle_core::DType::F32, &device)?;
        // Slots 2 and 3: uncond = 0, guided = 7.5 * slot.
        let cond = Conditioning::per_view(&[1, 2]);
        let eps = guided.predict_noise(&x, 10, &cond)?;
        let per_sample: Vec<f32> = eps.flatten(1, D::Minus1)?.mean(1)?.to_vec1()?;
        assert_eq!(per_sample, vec![15.0, 22.5]);
        assert_eq!(*guided.inner().calls.lock().unwrap(), vec![4]);
        assert_eq!(cond.unconditional().prompt_ids, vec![NULL_PROMPT, NULL_PROMPT]);
        Ok(())
    }

    #[test]
    fn test_scale_one_skips_unconditional_pass() -> Result<()> {
        let device = Device::Cpu;
        let guided = ClassifierFreeGuidance::new(
            PromptEcho {
                calls: Mutex::new(Vec::new()),
            },
            1.0,
        );
        let x = Tensor::zeros((1, 3, 2, 2), candle_core::DType::F32, &device)?;
        let eps = guided.predict_noise(&x, 10, &Conditioning::per_view(&[0]))?;
        assert_eq!(eps.flatten_all()?.to_vec1::<f32>()?, vec![1.0; 12]);
        assert_eq!(*guided.inner().calls.lock().unwrap(), vec![1]);
        Ok(())
    }
}
