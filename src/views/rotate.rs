use super::{View, flip, require_rank};
use crate::error::Result;
use candle_core::{D, Tensor};
use serde::{Deserialize, Serialize};

/// Clockwise rotation by `quarter_turns * 90` degrees over the last two dims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateView {
    quarter_turns: u8,
}

impl RotateView {
    pub fn new(quarter_turns: u8) -> Self {
        Self {
            quarter_turns: quarter_turns % 4,
        }
    }
}

/// Rotates `x` clockwise by `turns` quarter turns.
fn rotate_cw(x: &Tensor, turns: u8) -> Result<Tensor> {
    require_rank(x, 2, "rotation")?;
    match turns % 4 {
        0 => Ok(x.clone()),
        // out[i][j] = in[H-1-j][i]
        1 => flip(&x.transpose(D::Minus2, D::Minus1)?.contiguous()?, D::Minus1),
        2 => flip(&flip(x, D::Minus1)?, D::Minus2),
        // out[i][j] = in[j][W-1-i]
        _ => flip(&x.transpose(D::Minus2, D::Minus1)?.contiguous()?, D::Minus2),
    }
}

impl View for RotateView {
    fn forward(&self, canonical: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        rotate_cw(canonical, self.quarter_turns)
    }

    fn inverse(&self, view: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        rotate_cw(view, (4 - self.quarter_turns) % 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipAxis {
    /// Upside down (reverses rows).
    Vertical,
    /// Mirror image (reverses columns).
    Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipView {
    axis: FlipAxis,
}

impl FlipView {
    pub fn new(axis: FlipAxis) -> Self {
        Self { axis }
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        require_rank(x, 2, "flip")?;
        match self.axis {
            FlipAxis::Vertical => flip(x, D::Minus2),
            FlipAxis::Horizontal => flip(x, D::Minus1),
        }
    }
}

impl View for FlipView {
    fn forward(&self, canonical: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        self.apply(canonical)
    }

    fn inverse(&self, view: &Tensor, _background: Option<&Tensor>) -> Result<Tensor> {
        self.apply(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grid() -> Result<Tensor> {
        // [[0, 1, 2],
        //  [3, 4, 5]]
        Ok(Tensor::arange(0f32, 6f32, &Device::Cpu)?.reshape((1, 2, 3))?)
    }

    #[test]
    fn test_rotate_clockwise_layout() -> Result<()> {
        let out = RotateView::new(1).forward(&grid()?, None)?;
        assert_eq!(out.dims(), &[1, 3, 2]);
        assert_eq!(
            out.to_vec3::<f32>()?,
            vec![vec![vec![3.0, 0.0], vec![4.0, 1.0], vec![5.0, 2.0]]]
        );

        let out = RotateView::new(3).forward(&grid()?, None)?;
        assert_eq!(
            out.to_vec3::<f32>()?,
            vec![vec![vec![2.0, 5.0], vec![1.0, 4.0], vec![0.0, 3.0]]]
        );
        Ok(())
    }

    #[test]
    fn test_four_quarter_turns_return_original() -> Result<()> {
        let x = Tensor::randn(0f32, 1f32, (2, 4, 5, 5), &Device::Cpu)?;
        let view = RotateView::new(1);
        let mut y = x.clone();
        for _ in 0..4 {
            y = view.forward(&y, None)?;
        }
        let diff = (y - &x)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_rotate_and_flip_round_trip_exactly() -> Result<()> {
        let x = Tensor::randn(0f32, 1f32, (3, 4, 6), &Device::Cpu)?;
        let views: Vec<Box<dyn View>> = vec![
            Box::new(RotateView::new(1)),
            Box::new(RotateView::new(2)),
            Box::new(RotateView::new(3)),
            Box::new(RotateView::new(5)),
            Box::new(FlipView::new(FlipAxis::Vertical)),
            Box::new(FlipView::new(FlipAxis::Horizontal)),
        ];
        for view in &views {
            let back = view.inverse(&view.forward(&x, None)?, None)?;
            assert_eq!(back.dims(), x.dims());
            assert_eq!(back.to_vec3::<f32>()?, x.to_vec3::<f32>()?, "{view:?}");
        }
        Ok(())
    }

    #[test]
    fn test_rotate_rejects_vectors() {
        let v = Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(RotateView::new(1).forward(&v, None).is_err());
    }
}
