//! Coordinate views of the shared canvas.
//!
//! A view maps the canonical frame into its own frame (`forward`) and back
//! (`inverse`). Regions one side does not supply are taken from an explicit
//! background, or zeros when none is given.

mod channel;
mod crop;
mod rotate;

pub use channel::ChannelView;
pub use crop::CropView;
pub use rotate::{FlipAxis, FlipView, RotateView};

use crate::error::{Result, SyncError};
use candle_core::{D, Tensor};
use serde::{Deserialize, Serialize};

pub trait View: Send + Sync + std::fmt::Debug {
    /// Maps a canonical-frame array into this view's frame.
    fn forward(&self, canonical: &Tensor, background: Option<&Tensor>) -> Result<Tensor>;

    /// Maps a view-frame array back into the canonical frame.
    fn inverse(&self, view: &Tensor, background: Option<&Tensor>) -> Result<Tensor>;

    /// Canonical-frame mask that is 1 wherever this view contributes.
    fn coverage(&self, canvas: &Tensor) -> Result<Tensor> {
        let view_ones = self.forward(&canvas.ones_like()?, None)?.ones_like()?;
        let mapped = self.inverse(&view_ones, Some(&canvas.zeros_like()?))?;
        Ok(mapped.ne(&mapped.zeros_like()?)?.to_dtype(canvas.dtype())?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityView;

impl View for IdentityView {
    fn forward(&self, canonical: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        Ok(canonical.clone())
    }

    fn inverse(&self, view: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        Ok(view.clone())
    }
}

/// Color inversion, `x -> -x` in the model's [-1, 1] range.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegateView;

impl View for NegateView {
    fn forward(&self, canonical: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        Ok(canonical.affine(-1.0, 0.0)?)
    }

    fn inverse(&self, view: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        Ok(view.affine(-1.0, 0.0)?)
    }
}

/// Configuration form of a view, as it appears in run configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewSpec {
    Identity,
    Rotate { quarter_turns: u8 },
    Flip { axis: FlipAxis },
    Crop {
        top: usize,
        left: usize,
        height: usize,
        width: usize,
    },
    Channel { index: usize },
    Negate,
}

impl ViewSpec {
    /// Builds the view for a canvas of `channels x height x width`,
    /// rejecting windows or channels the canvas cannot provide.
    pub fn build(&self, channels: usize, height: usize, width: usize) -> Result<Box<dyn View>> {
        let view: Box<dyn View> = match *self {
            ViewSpec::Identity => Box::new(IdentityView),
            ViewSpec::Rotate { quarter_turns } => Box::new(RotateView::new(quarter_turns)),
            ViewSpec::Flip { axis } => Box::new(FlipView::new(axis)),
            ViewSpec::Crop {
                top,
                left,
                height: h,
                width: w,
            } => Box::new(CropView::new(top, left, h, w, height, width)?),
            ViewSpec::Channel { index } => Box::new(ChannelView::new(index, channels)?),
            ViewSpec::Negate => Box::new(NegateView),
        };
        Ok(view)
    }

    /// Sliding `window x window` crops across a `height x width` canvas.
    /// The last window is pinned to the right/bottom edge so every column is covered.
    pub fn sliding_windows(height: usize, width: usize, window: usize, stride: usize) -> Vec<ViewSpec> {
        let positions = |extent: usize| -> Vec<usize> {
            if extent <= window {
                return vec![0];
            }
            let mut starts: Vec<usize> = (0..=extent - window).step_by(stride.max(1)).collect();
            if starts.last() != Some(&(extent - window)) {
                starts.push(extent - window);
            }
            starts
        };
        let (win_h, win_w) = (window.min(height), window.min(width));
        let mut views = Vec::new();
        for top in positions(height) {
            for left in positions(width) {
                views.push(ViewSpec::Crop {
                    top,
                    left,
                    height: win_h,
                    width: win_w,
                });
            }
        }
        views
    }
}

/// Reverses `x` along `dim`.
pub(crate) fn flip(x: &Tensor, dim: D) -> Result<Tensor> {
    let len = x.dim(dim)?;
    let indices: Vec<u32> = (0..len as u32).rev().collect();
    let indices = Tensor::from_vec(indices, len, x.device())?;
    Ok(x.index_select(&indices, dim)?)
}

pub(crate) fn require_rank(x: &Tensor, min_rank: usize, what: &str) -> Result<()> {
    if x.rank() < min_rank {
        return Err(SyncError::InvalidView(format!(
            "{what} needs a tensor of rank >= {min_rank}, got shape {:?}",
            x.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_default_coverage_is_full_for_bijections() -> Result<()> {
        let canvas = Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu)?;
        for spec in [
            ViewSpec::Identity,
            ViewSpec::Rotate { quarter_turns: 1 },
            ViewSpec::Flip {
                axis: FlipAxis::Horizontal,
            },
            ViewSpec::Negate,
        ] {
            let view = spec.build(3, 4, 4)?;
            let mask = view.coverage(&canvas)?.flatten_all()?.to_vec1::<f32>()?;
            assert!(mask.iter().all(|&m| m == 1.0), "{spec:?}");
        }
        Ok(())
    }

    #[test]
    fn test_negate_round_trip() -> Result<()> {
        let x = Tensor::arange(0f32, 12f32, &Device::Cpu)?.reshape((3, 2, 2))?;
        let view = NegateView;
        let back = view.inverse(&view.forward(&x, None)?, None)?;
        assert_eq!(back.to_vec3::<f32>()?, x.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_sliding_windows_cover_the_canvas() {
        let views = ViewSpec::sliding_windows(64, 512, 64, 8);
        assert_eq!(views.len(), 57);
        assert_eq!(
            views.last(),
            Some(&ViewSpec::Crop {
                top: 0,
                left: 448,
                height: 64,
                width: 64
            })
        );

        // 100 - 64 = 36 is not a multiple of 8, so the edge window is appended.
        let views = ViewSpec::sliding_windows(64, 100, 64, 8);
        let lefts: Vec<usize> = views
            .iter()
            .map(|v| match v {
                ViewSpec::Crop { left, .. } => *left,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(lefts, vec![0, 8, 16, 24, 32, 36]);
    }

    #[test]
    fn test_view_spec_json() -> anyhow::Result<()> {
        let specs: Vec<ViewSpec> = serde_json::from_str(
            r#"[{"kind":"identity"},{"kind":"rotate","quarter_turns":2},
                {"kind":"crop","top":0,"left":8,"height":4,"width":4},
                {"kind":"flip","axis":"vertical"}]"#,
        )?;
        assert_eq!(specs[1], ViewSpec::Rotate { quarter_turns: 2 });
        assert_eq!(
            specs[3],
            ViewSpec::Flip {
                axis: FlipAxis::Vertical
            }
        );
        Ok(())
    }

    #[test]
    fn test_build_rejects_bad_views() {
        let crop = ViewSpec::Crop {
            top: 0,
            left: 60,
            height: 8,
            width: 8,
        };
        assert!(matches!(crop.build(4, 8, 64), Err(SyncError::InvalidView(_))));
        let channel = ViewSpec::Channel { index: 3 };
        assert!(matches!(channel.build(3, 8, 8), Err(SyncError::InvalidView(_))));
    }
}
