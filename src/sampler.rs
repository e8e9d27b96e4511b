use crate::error::{Result, SyncError};
use crate::models::{Conditioning, NoisePredictor};
use crate::schedule::NoiseSchedule;
use crate::sync::ViewSynchronizer;
use crate::tweedie::estimate_clean;
use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use tracing::{debug, info};

/// Standard normal noise drawn from an explicit generator.
pub fn initial_noise(shape: &[usize], dtype: DType, device: &Device, rng: &mut StdRng) -> Result<Tensor> {
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
}

/// Progress report after each reverse step.
#[derive(Debug)]
pub struct StepEvent<'a> {
    pub step_index: usize,
    pub timestep: usize,
    pub canonical: &'a Tensor,
}

#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// Canonical clean estimate after the terminal step.
    pub canvas: Tensor,
    /// Final per-view samples.
    pub views: Vec<Tensor>,
    /// Timesteps in the order they were visited.
    pub timesteps: Vec<usize>,
}

/// Synchronized DDIM sampling over a set of views.
pub struct SyncSampler<'a> {
    schedule: &'a NoiseSchedule,
    synchronizer: &'a ViewSynchronizer,
    sync_enabled: bool,
}

impl<'a> SyncSampler<'a> {
    pub fn new(schedule: &'a NoiseSchedule, synchronizer: &'a ViewSynchronizer) -> Self {
        Self {
            schedule,
            synchronizer,
            sync_enabled: true,
        }
    }

    /// Without synchronization every view keeps its own estimate; the
    /// canonical estimate is still aggregated for output.
    pub fn with_sync(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    /// Runs the full reverse schedule from canvas noise `z_t`.
    ///
    /// # Arguments
    /// * `predictor` - Noise prediction capability.
    /// * `conditioning` - One entry per view (`view_ids` 0..N in order).
    /// * `z_t` - Initial canvas noise, also the first background.
    /// * `observer` - Called after every step with the canonical estimate.
    pub fn sample<F>(
        &self,
        predictor: &dyn NoisePredictor,
        conditioning: &Conditioning,
        z_t: Tensor,
        mut observer: F,
    ) -> Result<SampleOutput>
    where
        F: FnMut(StepEvent<'_>),
    {
        if conditioning.len() != self.synchronizer.len() {
            return Err(SyncError::ViewCountMismatch {
                views: self.synchronizer.len(),
                estimates: conditioning.len(),
            });
        }
        let mut canvas = z_t;
        let mut xts = self.synchronizer.forward_all(&canvas, None)?;
        let timesteps = self.schedule.timesteps().to_vec();
        info!(
            "Sampling {} views over {} steps (sync={})",
            xts.len(),
            timesteps.len(),
            self.sync_enabled
        );

        for (step_index, &t) in timesteps.iter().enumerate() {
            let eps = predict_all(predictor, &xts, t, conditioning)?;

            let x0s = xts
                .iter()
                .zip(&eps)
                .map(|(x_t, eps)| estimate_clean(x_t, eps, t, self.schedule))
                .collect::<Result<Vec<_>>>()?;

            let (canonical, x0s) = if self.sync_enabled {
                let synced = self.synchronizer.synchronize(&x0s, &canvas)?;
                (synced.canonical, synced.views)
            } else {
                (self.synchronizer.aggregate(&x0s, &canvas)?, x0s)
            };

            xts = xts
                .iter()
                .zip(&x0s)
                .map(|(x_t, x0)| self.schedule.previous_sample(x_t, x0, t))
                .collect::<Result<Vec<_>>>()?;
            canvas = canonical;

            debug!("step {}/{} t={}", step_index + 1, timesteps.len(), t);
            observer(StepEvent {
                step_index,
                timestep: t,
                canonical: &canvas,
            });
        }

        Ok(SampleOutput {
            canvas,
            views: xts,
            timesteps,
        })
    }
}

/// Noise for every view: one batched call when all views share a shape,
/// otherwise one call per view.
fn predict_all(
    predictor: &dyn NoisePredictor,
    xts: &[Tensor],
    timestep: usize,
    conditioning: &Conditioning,
) -> Result<Vec<Tensor>> {
    let uniform = xts.windows(2).all(|w| w[0].dims() == w[1].dims());
    if uniform {
        let batch = Tensor::stack(xts, 0)?;
        let eps = predictor.predict_noise(&batch, timestep, conditioning)?;
        (0..xts.len()).map(|i| Ok(eps.get(i)?)).collect()
    } else {
        xts.iter()
            .enumerate()
            .map(|(i, x_t)| {
                let eps = predictor.predict_noise(&x_t.unsqueeze(0)?, timestep, &conditioning.select(i)?)?;
                Ok(eps.squeeze(0)?)
            })
            .collect()
    }
}
