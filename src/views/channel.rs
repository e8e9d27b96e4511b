use super::{View, require_rank};
use crate::error::{Result, SyncError};
use candle_core::{D, Tensor};

/// Exchanges a single color channel with the canvas.
///
/// Both directions keep channel `index` from the input and fill the
/// remaining channels from the background (zeros without one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelView {
    index: usize,
    channels: usize,
}

impl ChannelView {
    pub fn new(index: usize, channels: usize) -> Result<Self> {
        if index >= channels {
            return Err(SyncError::InvalidView(format!(
                "channel {index} out of range for {channels} channels"
            )));
        }
        Ok(Self { index, channels })
    }

    fn isolate(&self, x: &Tensor, background: Option<&Tensor>) -> Result<Tensor> {
        require_rank(x, 3, "channel isolation")?;
        let channels = x.dim(D::Minus(3))?;
        if channels != self.channels {
            let mut expected = x.dims().to_vec();
            let rank = expected.len();
            expected[rank - 3] = self.channels;
            return Err(SyncError::ShapeMismatch {
                expected,
                actual: x.dims().to_vec(),
            });
        }

        let mut keep = vec![0f32; channels];
        keep[self.index] = 1.0;
        let keep = Tensor::from_vec(keep, (channels, 1, 1), x.device())?.to_dtype(x.dtype())?;
        let selected = x.broadcast_mul(&keep)?;
        match background {
            Some(bg) => {
                if bg.dims() != x.dims() {
                    return Err(SyncError::ShapeMismatch {
                        expected: x.dims().to_vec(),
                        actual: bg.dims().to_vec(),
                    });
                }
                let rest = bg.to_dtype(x.dtype())?.broadcast_mul(&keep.affine(-1.0, 1.0)?)?;
                Ok((selected + rest)?)
            }
            None => Ok(selected),
        }
    }
}

impl View for ChannelView {
    fn forward(&self, canonical: &Tensor, background: Option<&Tensor>) -> Result<Tensor> {
        self.isolate(canonical, background)
    }

    fn inverse(&self, view: &Tensor, background: Option<&Tensor>) -> Result<Tensor> {
        self.isolate(view, background)
    }
}
