use super::{Conditioning, NoisePredictor};
use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, Linear, VarBuilder};
use std::path::Path;
use tracing::{info, warn};

// --- 1. Timestep Embedding ---
// Sinusoidal features of the diffusion timestep, followed by a two-layer MLP.
pub struct TimestepEmbedding {
    dim: usize,
    projection1: Linear,
    projection2: Linear,
}

impl TimestepEmbedding {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let projection1 = candle_nn::linear(dim, dim, vb.pp("projection1"))?;
        let projection2 = candle_nn::linear(dim, dim, vb.pp("projection2"))?;
        Ok(Self {
            dim,
            projection1,
            projection2,
        })
    }

    /// `timesteps`: [batch] f32 -> [batch, dim]
    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let half = self.dim / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(10_000f32.ln()) * i as f32 / half as f32).exp())
            .collect();
        let freqs = Tensor::from_vec(freqs, (1, half), timesteps.device())?;
        let args = timesteps
            .to_dtype(DType::F32)?
            .unsqueeze(1)?
            .broadcast_mul(&freqs)?;
        let emb = Tensor::cat(&[args.sin()?, args.cos()?], D::Minus1)?;
        let emb = if emb.dim(D::Minus1)? < self.dim {
            emb.pad_with_zeros(D::Minus1, 0, self.dim - emb.dim(D::Minus1)?)?
        } else {
            emb
        };
        let emb = emb.to_dtype(self.projection1.weight().dtype())?;

        let x = self.projection1.forward(&emb)?;
        let x = candle_nn::ops::silu(&x)?;
        let x = self.projection2.forward(&x)?;
        candle_nn::ops::silu(&x)
    }
}

// --- 2. Residual Block ---
// Dilated 3x3 convolution with gated activation, conditioned on time and prompt.
pub struct ResidualBlock {
    dilated_conv: Conv2d,
    time_projection: Linear,
    prompt_projection: Linear,
    output_projection: Conv2d,
}

impl ResidualBlock {
    pub fn new(channels: usize, emb_dim: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: dilation,
            dilation,
            ..Default::default()
        };
        let dilated_conv = candle_nn::conv2d(channels, 2 * channels, 3, conv_cfg, vb.pp("dilated_conv"))?;
        let time_projection = candle_nn::linear(emb_dim, 2 * channels, vb.pp("time_projection"))?;
        let prompt_projection = candle_nn::linear(emb_dim, 2 * channels, vb.pp("prompt_projection"))?;
        let output_projection = candle_nn::conv2d(
            channels,
            2 * channels, // residual + skip
            1,
            Default::default(),
            vb.pp("output_projection"),
        )?;
        Ok(Self {
            dilated_conv,
            time_projection,
            prompt_projection,
            output_projection,
        })
    }

    /// x: [batch, channels, h, w]; embeddings: [batch, emb_dim]
    pub fn forward(&self, x: &Tensor, time_emb: &Tensor, prompt_emb: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = self.dilated_conv.forward(x)?;
        let t = self.time_projection.forward(time_emb)?.unsqueeze(2)?.unsqueeze(3)?;
        let p = self.prompt_projection.forward(prompt_emb)?.unsqueeze(2)?.unsqueeze(3)?;
        let h = h.broadcast_add(&t)?.broadcast_add(&p)?;

        let chunks = h.chunk(2, 1)?;
        let filter = chunks[0].tanh()?;
        let gate = candle_nn::ops::sigmoid(&chunks[1])?;
        let h = filter.mul(&gate)?;

        let out = self.output_projection.forward(&h)?;
        let chunks = out.chunk(2, 1)?;
        let residual = ((x + &chunks[0])? / 2f64.sqrt())?;
        Ok((residual, chunks[1].clone()))
    }
}

/// Hyper-parameters of [`ConvEpsilonModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpsilonModelConfig {
    pub in_channels: usize,
    /// `2 * in_channels` for models that also predict a variance.
    pub out_channels: usize,
    pub hidden_channels: usize,
    pub num_blocks: usize,
    /// Number of prompt slots, including the empty prompt.
    pub prompt_slots: usize,
}

// --- 3. Epsilon network ---
pub struct ConvEpsilonModel {
    dtype: DType,
    input_projection: Conv2d,
    time_embedding: TimestepEmbedding,
    prompt_embedding: Embedding,
    residual_layers: Vec<ResidualBlock>,
    skip_projection: Conv2d,
    output_projection: Conv2d,
}

impl ConvEpsilonModel {
    pub fn new(config: EpsilonModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_channels;
        let input_projection = candle_nn::conv2d(
            config.in_channels,
            hidden,
            1,
            Default::default(),
            vb.pp("input_projection"),
        )?;
        let time_embedding = TimestepEmbedding::new(hidden, vb.pp("time_embedding"))?;
        let prompt_embedding = candle_nn::embedding(config.prompt_slots, hidden, vb.pp("prompt_embedding"))?;

        let mut residual_layers = Vec::with_capacity(config.num_blocks);
        for i in 0..config.num_blocks {
            let dilation = 2usize.pow(i as u32 % 4);
            residual_layers.push(ResidualBlock::new(
                hidden,
                hidden,
                dilation,
                vb.pp(format!("residual_block_{}", i)),
            )?);
        }

        let skip_projection = candle_nn::conv2d(hidden, hidden, 1, Default::default(), vb.pp("skip_projection"))?;
        let output_projection = candle_nn::conv2d(
            hidden,
            config.out_channels,
            1,
            Default::default(),
            vb.pp("output_projection"),
        )?;

        Ok(Self {
            dtype: vb.dtype(),
            input_projection,
            time_embedding,
            prompt_embedding,
            residual_layers,
            skip_projection,
            output_projection,
        })
    }

    /// Loads weights from a safetensors checkpoint, or zero weights when the
    /// file is missing.
    pub fn load(config: EpsilonModelConfig, weights: Option<&Path>, dtype: DType, device: &Device) -> Result<Self> {
        let vb = match weights {
            Some(path) if path.exists() => {
                info!("Loading epsilon model weights from {}", path.display());
                unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? }
            }
            Some(path) => {
                warn!(
                    "{} not found, using zero weights. Predictions will be meaningless.",
                    path.display()
                );
                VarBuilder::zeros(dtype, device)
            }
            None => {
                warn!("No model weights configured, using zero weights. Predictions will be meaningless.");
                VarBuilder::zeros(dtype, device)
            }
        };
        Self::new(config, vb)
    }

    /// x: [batch, in_channels, h, w] -> [batch, out_channels, h, w]
    pub fn forward(&self, x: &Tensor, timesteps: &Tensor, prompt_ids: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(self.dtype)?;
        let mut h = candle_nn::ops::silu(&self.input_projection.forward(&x)?)?;
        let time_emb = self.time_embedding.forward(timesteps)?;
        let prompt_emb = self.prompt_embedding.forward(prompt_ids)?;

        let mut total_skip: Option<Tensor> = None;
        for layer in &self.residual_layers {
            let (next, skip) = layer.forward(&h, &time_emb, &prompt_emb)?;
            h = next;
            total_skip = Some(match total_skip {
                Some(acc) => (acc + skip)?,
                None => skip,
            });
        }

        let h = match total_skip {
            Some(skip) => (skip / (self.residual_layers.len() as f64).sqrt())?,
            None => h,
        };
        let h = candle_nn::ops::silu(&self.skip_projection.forward(&h)?)?;
        self.output_projection.forward(&h)
    }
}

impl NoisePredictor for ConvEpsilonModel {
    fn predict_noise(
        &self,
        samples: &Tensor,
        timestep: usize,
        conditioning: &Conditioning,
    ) -> crate::error::Result<Tensor> {
        let batch = samples.dim(0)?;
        if conditioning.len() != batch {
            return Err(crate::error::SyncError::ShapeMismatch {
                expected: vec![batch],
                actual: vec![conditioning.len()],
            });
        }
        let device = samples.device();
        let timesteps = Tensor::full(timestep as f32, batch, device)?;
        let prompt_ids = Tensor::new(conditioning.prompt_ids.as_slice(), device)?;
        Ok(self.forward(samples, &timesteps, &prompt_ids)?)
    }
}
