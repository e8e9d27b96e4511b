//! Reconciles per-view clean estimates through the shared canvas.
//!
//! Every step each view's estimate is mapped back to the canonical frame,
//! averaged over the views that cover each coordinate, and mapped forward
//! again, so all views continue from the same belief about the clean image.

use crate::error::{Result, SyncError};
use crate::views::View;
use candle_core::Tensor;
use rayon::prelude::*;
use tracing::debug;

/// Output of one synchronization pass.
#[derive(Debug, Clone)]
pub struct Synchronized {
    /// Canonical clean estimate; uncovered coordinates keep the background.
    pub canonical: Tensor,
    /// Reconciled per-view estimates, in view order.
    pub views: Vec<Tensor>,
}

pub struct ViewSynchronizer {
    views: Vec<Box<dyn View>>,
    coverage: Vec<Tensor>,
    /// 1 where at least one view covers the coordinate.
    covered: Tensor,
    /// Coverage count, with 1 in place of 0 so the mean never divides by zero.
    denominator: Tensor,
    zeros: Tensor,
}

impl std::fmt::Debug for ViewSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSynchronizer")
            .field("views", &self.views)
            .field("canvas", &self.zeros.dims())
            .finish()
    }
}

impl ViewSynchronizer {
    /// Precomputes coverage for a canvas shaped like `canvas`.
    pub fn new(views: Vec<Box<dyn View>>, canvas: &Tensor) -> Result<Self> {
        if views.is_empty() {
            return Err(SyncError::InvalidView("at least one view is required".to_string()));
        }
        let coverage = views
            .par_iter()
            .map(|view| view.coverage(canvas))
            .collect::<Result<Vec<_>>>()?;

        let zeros = canvas.zeros_like()?;
        let mut count = zeros.clone();
        for mask in &coverage {
            count = (count + mask)?;
        }
        let covered = count.gt(&zeros)?;
        let denominator = covered.where_cond(&count, &canvas.ones_like()?)?;

        let uncovered = covered.to_dtype(candle_core::DType::F32)?.affine(-1.0, 1.0)?.sum_all()?.to_scalar::<f32>()?;
        if uncovered > 0.0 {
            debug!("{} canonical coordinates are not covered by any view", uncovered);
        }

        Ok(Self {
            views,
            coverage,
            covered,
            denominator,
            zeros,
        })
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Maps the canvas into every view.
    pub fn forward_all(&self, canonical: &Tensor, backgrounds: Option<&[Tensor]>) -> Result<Vec<Tensor>> {
        if let Some(bgs) = backgrounds {
            self.check_count(bgs.len())?;
        }
        self.views
            .par_iter()
            .enumerate()
            .map(|(i, view)| view.forward(canonical, backgrounds.map(|bgs| &bgs[i])))
            .collect()
    }

    /// Mean of the inverse-mapped estimates over covering views; coordinates
    /// no view covers come from `background`.
    pub fn aggregate(&self, estimates: &[Tensor], background: &Tensor) -> Result<Tensor> {
        self.check_count(estimates.len())?;
        if background.dims() != self.zeros.dims() {
            return Err(SyncError::ShapeMismatch {
                expected: self.zeros.dims().to_vec(),
                actual: background.dims().to_vec(),
            });
        }
        let candidates = self
            .views
            .par_iter()
            .zip(estimates.par_iter())
            .map(|(view, x0)| view.inverse(x0, Some(&self.zeros)))
            .collect::<Result<Vec<_>>>()?;

        // Reduce in view order so repeated runs are bit-identical.
        let mut sum = self.zeros.clone();
        for (candidate, mask) in candidates.iter().zip(&self.coverage) {
            sum = (sum + candidate.mul(mask)?)?;
        }
        let mean = sum.div(&self.denominator)?;
        Ok(self.covered.where_cond(&mean, &background.to_dtype(mean.dtype())?)?)
    }

    /// Inverse-map, average, forward-map. Each view's own estimate fills
    /// whatever its transform does not take from the canvas.
    pub fn synchronize(&self, estimates: &[Tensor], background: &Tensor) -> Result<Synchronized> {
        let canonical = self.aggregate(estimates, background)?;
        let views = self.forward_all(&canonical, Some(estimates))?;
        Ok(Synchronized { canonical, views })
    }

    fn check_count(&self, estimates: usize) -> Result<()> {
        if estimates != self.views.len() {
            return Err(SyncError::ViewCountMismatch {
                views: self.views.len(),
                estimates,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::{ChannelView, CropView, IdentityView, RotateView};
    use candle_core::{DType, Device};

    fn values(t: &Tensor) -> Result<Vec<f32>> {
        Ok(t.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_two_overlapping_views_average() -> Result<()> {
        let device = Device::Cpu;
        let canvas = Tensor::zeros((1, 1, 6), DType::F32, &device)?;
        // Columns 0..4 and 2..6 overlap on 2..4.
        let views: Vec<Box<dyn View>> = vec![
            Box::new(CropView::new(0, 0, 1, 4, 1, 6)?),
            Box::new(CropView::new(0, 2, 1, 4, 1, 6)?),
        ];
        let sync = ViewSynchronizer::new(views, &canvas)?;
        let a = Tensor::full(2f32, (1, 1, 4), &device)?;
        let b = Tensor::full(6f32, (1, 1, 4), &device)?;

        let out = sync.synchronize(&[a, b], &canvas)?;
        assert_eq!(values(&out.canonical)?, vec![2.0, 2.0, 4.0, 4.0, 6.0, 6.0]);
        assert_eq!(values(&out.views[0])?, vec![2.0, 2.0, 4.0, 4.0]);
        assert_eq!(values(&out.views[1])?, vec![4.0, 4.0, 6.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_three_way_overlap_is_uniform_mean() -> Result<()> {
        let device = Device::Cpu;
        let canvas = Tensor::zeros((1, 1, 5), DType::F32, &device)?;
        let views: Vec<Box<dyn View>> = vec![
            Box::new(CropView::new(0, 0, 1, 3, 1, 5)?),
            Box::new(CropView::new(0, 1, 1, 3, 1, 5)?),
            Box::new(CropView::new(0, 2, 1, 3, 1, 5)?),
        ];
        let sync = ViewSynchronizer::new(views, &canvas)?;
        let estimates = [
            Tensor::full(3f32, (1, 1, 3), &device)?,
            Tensor::full(6f32, (1, 1, 3), &device)?,
            Tensor::full(9f32, (1, 1, 3), &device)?,
        ];
        let canonical = sync.aggregate(&estimates, &canvas)?;
        assert_eq!(values(&canonical)?, vec![3.0, 4.5, 6.0, 7.5, 9.0]);
        Ok(())
    }

    #[test]
    fn test_uncovered_region_keeps_background() -> Result<()> {
        let device = Device::Cpu;
        let background = Tensor::full(-1f32, (1, 2, 4), &device)?;
        let views: Vec<Box<dyn View>> = vec![Box::new(CropView::new(0, 1, 2, 2, 2, 4)?)];
        let sync = ViewSynchronizer::new(views, &background)?;
        let estimate = Tensor::full(3f32, (1, 2, 2), &device)?;
        let canonical = sync.aggregate(&[estimate], &background)?;
        assert_eq!(
            values(&canonical)?,
            vec![-1.0, 3.0, 3.0, -1.0, -1.0, 3.0, 3.0, -1.0]
        );
        Ok(())
    }

    #[test]
    fn test_channel_views_use_their_own_estimate_as_background() -> Result<()> {
        let device = Device::Cpu;
        let canvas = Tensor::zeros((2, 1, 1), DType::F32, &device)?;
        let views: Vec<Box<dyn View>> = vec![
            Box::new(ChannelView::new(0, 2)?),
            Box::new(ChannelView::new(1, 2)?),
        ];
        let sync = ViewSynchronizer::new(views, &canvas)?;
        let a = Tensor::new(&[[[1f32]], [[10f32]]], &device)?;
        let b = Tensor::new(&[[[20f32]], [[2f32]]], &device)?;
        let out = sync.synchronize(&[a, b], &canvas)?;

        assert_eq!(values(&out.canonical)?, vec![1.0, 2.0]);
        // View 0 only exchanges channel 0, channel 1 stays its own.
        assert_eq!(values(&out.views[0])?, vec![1.0, 10.0]);
        assert_eq!(values(&out.views[1])?, vec![20.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_consistent_rotations_are_a_fixed_point() -> Result<()> {
        let device = Device::Cpu;
        let canvas = Tensor::randn(0f32, 1f32, (3, 4, 4), &device)?;
        let views: Vec<Box<dyn View>> = (0..4u8)
            .map(|k| Box::new(RotateView::new(k)) as Box<dyn View>)
            .collect();
        let sync = ViewSynchronizer::new(views, &canvas)?;
        let estimates = sync.forward_all(&canvas, None)?;
        let out = sync.synchronize(&estimates, &canvas.zeros_like()?)?;

        let diff = (&out.canonical - &canvas)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_estimate_count_must_match() -> Result<()> {
        let device = Device::Cpu;
        let canvas = Tensor::zeros((1, 2, 2), DType::F32, &device)?;
        let views: Vec<Box<dyn View>> = vec![Box::new(IdentityView), Box::new(IdentityView)];
        let sync = ViewSynchronizer::new(views, &canvas)?;
        assert!(matches!(
            sync.synchronize(&[canvas.clone()], &canvas),
            Err(SyncError::ViewCountMismatch { views: 2, estimates: 1 })
        ));
        Ok(())
    }
}
