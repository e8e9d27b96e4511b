pub mod epsilon;
pub mod guidance;
pub mod oracle;

pub use epsilon::ConvEpsilonModel;
pub use guidance::ClassifierFreeGuidance;
pub use oracle::OracleNoisePredictor;

use crate::error::{Result, SyncError};
use candle_core::Tensor;

/// Prompt slot reserved for the unconditional (empty) prompt.
pub const NULL_PROMPT: u32 = 0;

/// Per-sample conditioning for one predictor call.
///
/// `prompt_ids[i]` is the prompt slot of sample `i` (`NULL_PROMPT` for the
/// empty prompt, `p + 1` for configured prompt `p`); `view_ids[i]` is the
/// view the sample belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditioning {
    pub prompt_ids: Vec<u32>,
    pub view_ids: Vec<usize>,
}

impl Conditioning {
    /// One sample per view, view `i` conditioned on prompt `view_prompts[i]`.
    pub fn per_view(view_prompts: &[usize]) -> Self {
        Self {
            prompt_ids: view_prompts.iter().map(|&p| p as u32 + 1).collect(),
            view_ids: (0..view_prompts.len()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.prompt_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_ids.is_empty()
    }

    /// Same samples, every one on the empty prompt.
    pub fn unconditional(&self) -> Self {
        Self {
            prompt_ids: vec![NULL_PROMPT; self.prompt_ids.len()],
            view_ids: self.view_ids.clone(),
        }
    }

    /// Conditioning for a single sample.
    pub fn select(&self, index: usize) -> Result<Self> {
        match (self.prompt_ids.get(index), self.view_ids.get(index)) {
            (Some(&prompt_id), Some(&view_id)) => Ok(Self {
                prompt_ids: vec![prompt_id],
                view_ids: vec![view_id],
            }),
            _ => Err(SyncError::ViewCountMismatch {
                views: index + 1,
                estimates: self.len(),
            }),
        }
    }

    pub fn concat(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.prompt_ids.extend_from_slice(&other.prompt_ids);
        out.view_ids.extend_from_slice(&other.view_ids);
        out
    }
}

/// Predicts the noise in a batch of samples `[N, C, H, W]` at one timestep.
///
/// The result may carry extra trailing channels (variance heads) and may be
/// in a different dtype than `samples`; the Tweedie step reconciles both.
pub trait NoisePredictor: Send + Sync {
    fn predict_noise(&self, samples: &Tensor, timestep: usize, conditioning: &Conditioning) -> Result<Tensor>;
}

impl<P: NoisePredictor + ?Sized> NoisePredictor for Box<P> {
    fn predict_noise(&self, samples: &Tensor, timestep: usize, conditioning: &Conditioning) -> Result<Tensor> {
        (**self).predict_noise(samples, timestep, conditioning)
    }
}
