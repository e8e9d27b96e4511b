use super::{View, require_rank};
use crate::error::{Result, SyncError};
use candle_core::{D, Tensor};
use std::ops::Range;

/// A `height x width` window placed at `(top, left)` in the canvas.
///
/// The view frame is fully covered by the canvas, so `forward` never needs
/// a background. `inverse` writes the window into the background and leaves
/// every other canonical coordinate untouched (zeros without a background).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropView {
    top: usize,
    left: usize,
    height: usize,
    width: usize,
    canvas_height: usize,
    canvas_width: usize,
}

impl CropView {
    pub fn new(
        top: usize,
        left: usize,
        height: usize,
        width: usize,
        canvas_height: usize,
        canvas_width: usize,
    ) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(SyncError::InvalidView(format!(
                "crop window must be non-empty, got {height}x{width}"
            )));
        }
        if top + height > canvas_height || left + width > canvas_width {
            return Err(SyncError::InvalidView(format!(
                "crop window {height}x{width} at ({top}, {left}) exceeds canvas {canvas_height}x{canvas_width}"
            )));
        }
        Ok(Self {
            top,
            left,
            height,
            width,
            canvas_height,
            canvas_width,
        })
    }

    fn check_spatial(&self, x: &Tensor, height: usize, width: usize) -> Result<()> {
        require_rank(x, 2, "crop")?;
        let (h, w) = (x.dim(D::Minus2)?, x.dim(D::Minus1)?);
        if (h, w) != (height, width) {
            let mut expected = x.dims().to_vec();
            let rank = expected.len();
            expected[rank - 2] = height;
            expected[rank - 1] = width;
            return Err(SyncError::ShapeMismatch {
                expected,
                actual: x.dims().to_vec(),
            });
        }
        Ok(())
    }
}

impl View for CropView {
    fn forward(&self, canonical: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        self.check_spatial(canonical, self.canvas_height, self.canvas_width)?;
        Ok(canonical
            .narrow(D::Minus2, self.top, self.height)?
            .narrow(D::Minus1, self.left, self.width)?
            .contiguous()?)
    }

    fn inverse(&self, view: &Tensor, background: Option<&Tensor>) -> Result<Tensor> {
        self.check_spatial(view, self.height, self.width)?;
        let canvas = match background {
            Some(bg) => {
                self.check_spatial(bg, self.canvas_height, self.canvas_width)?;
                bg.to_dtype(view.dtype())?
            }
            None => {
                let mut dims = view.dims().to_vec();
                let rank = dims.len();
                dims[rank - 2] = self.canvas_height;
                dims[rank - 1] = self.canvas_width;
                Tensor::zeros(dims, view.dtype(), view.device())?
            }
        };

        let rank = view.rank();
        let mut ranges: Vec<Range<usize>> = view.dims()[..rank - 2].iter().map(|&d| 0..d).collect();
        ranges.push(self.top..self.top + self.height);
        ranges.push(self.left..self.left + self.width);
        Ok(canvas.slice_assign(&ranges, &view.contiguous()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_forward_selects_window() -> Result<()> {
        let canvas = Tensor::arange(0f32, 24f32, &Device::Cpu)?.reshape((1, 4, 6))?;
        let view = CropView::new(1, 2, 2, 3, 4, 6)?;
        let out = view.forward(&canvas, None)?;
        assert_eq!(
            out.to_vec3::<f32>()?,
            vec![vec![vec![8.0, 9.0, 10.0], vec![14.0, 15.0, 16.0]]]
        );
        Ok(())
    }

    #[test]
    fn test_inverse_places_window_over_background() -> Result<()> {
        let device = Device::Cpu;
        let view = CropView::new(0, 1, 2, 2, 2, 4)?;
        let patch = Tensor::ones((1, 2, 2), DType::F32, &device)?;
        let bg = Tensor::full(5f32, (1, 2, 4), &device)?;

        let placed = view.inverse(&patch, Some(&bg))?;
        assert_eq!(
            placed.to_vec3::<f32>()?,
            vec![vec![vec![5.0, 1.0, 1.0, 5.0], vec![5.0, 1.0, 1.0, 5.0]]]
        );

        let placed = view.inverse(&patch, None)?;
        assert_eq!(
            placed.to_vec3::<f32>()?,
            vec![vec![vec![0.0, 1.0, 1.0, 0.0], vec![0.0, 1.0, 1.0, 0.0]]]
        );
        Ok(())
    }

    #[test]
    fn test_round_trip_on_window_region() -> Result<()> {
        let device = Device::Cpu;
        let canvas = Tensor::randn(0f32, 1f32, (4, 8, 16), &device)?;
        let view = CropView::new(0, 4, 8, 8, 8, 16)?;
        let back = view.inverse(&view.forward(&canvas, None)?, Some(&canvas))?;
        assert_eq!(back.to_vec3::<f32>()?, canvas.to_vec3::<f32>()?);

        let mask = view.coverage(&canvas)?;
        let covered = mask.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(covered, (4 * 8 * 8) as f32);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_reported() -> Result<()> {
        let view = CropView::new(0, 0, 4, 4, 8, 8)?;
        let wrong = Tensor::zeros((3, 8, 9), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            view.forward(&wrong, None),
            Err(SyncError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
