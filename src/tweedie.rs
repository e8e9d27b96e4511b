use crate::error::{Result, SyncError};
use crate::schedule::NoiseSchedule;
use candle_core::{D, Tensor};

/// Tweedie estimate of the clean signal:
/// `x0 = (x_t - sqrt(1 - a_t) * eps) / sqrt(a_t)`.
///
/// `eps` is cast to the sample's dtype first. Extra trailing channels in
/// `eps` (variance heads) are dropped; any other shape difference is an error.
pub fn estimate_clean(
    x_t: &Tensor,
    eps: &Tensor,
    timestep: usize,
    schedule: &NoiseSchedule,
) -> Result<Tensor> {
    let eps = match_channels(x_t, eps)?.to_dtype(x_t.dtype())?;
    let (sqrt_alpha, sqrt_one_minus_alpha) = schedule.coefficients(timestep)?;
    Ok((x_t - eps.affine(sqrt_one_minus_alpha, 0.0)?)?.affine(1.0 / sqrt_alpha, 0.0)?)
}

/// Keeps the leading channels of `eps` that line up with `x_t`.
pub fn match_channels(x_t: &Tensor, eps: &Tensor) -> Result<Tensor> {
    let mismatch = || SyncError::ShapeMismatch {
        expected: x_t.dims().to_vec(),
        actual: eps.dims().to_vec(),
    };
    if x_t.dims() == eps.dims() {
        return Ok(eps.clone());
    }
    if x_t.rank() < 3 || x_t.rank() != eps.rank() {
        return Err(mismatch());
    }

    let rank = x_t.rank();
    let (channels, predicted) = (x_t.dim(D::Minus(3))?, eps.dim(D::Minus(3))?);
    let other_dims_match = x_t
        .dims()
        .iter()
        .zip(eps.dims())
        .enumerate()
        .all(|(i, (a, b))| i == rank - 3 || a == b);
    if !other_dims_match || predicted < channels {
        return Err(mismatch());
    }
    Ok(eps.narrow(D::Minus(3), 0, channels)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleConfig;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_tweedie_inverts_forward_noising() -> Result<()> {
        let device = Device::Cpu;
        let schedule = NoiseSchedule::new(&ScheduleConfig::stable_diffusion(), 50)?;
        let x0 = Tensor::randn(0f32, 1f32, (2, 4, 8, 8), &device)?;
        let eps = Tensor::randn(0f32, 1f32, (2, 4, 8, 8), &device)?;

        for &t in schedule.timesteps() {
            let x_t = schedule.add_noise(&x0, &eps, t)?;
            let recovered = estimate_clean(&x_t, &eps, t, &schedule)?;
            // sqrt(a_t) is ~0.07 at the noisiest step, which amplifies f32 rounding.
            assert!(max_abs_diff(&recovered, &x0)? < 1e-3, "t = {t}");
        }
        Ok(())
    }

    #[test]
    fn test_variance_channels_are_truncated() -> Result<()> {
        let device = Device::Cpu;
        let schedule = NoiseSchedule::new(&ScheduleConfig::deepfloyd(), 10)?;
        let x_t = Tensor::randn(0f32, 1f32, (1, 3, 4, 4), &device)?;
        let eps = Tensor::randn(0f32, 1f32, (1, 3, 4, 4), &device)?;
        let variance = Tensor::full(100f32, (1, 3, 4, 4), &device)?;
        let eps6 = Tensor::cat(&[&eps, &variance], 1)?;

        let with_variance = estimate_clean(&x_t, &eps6, 500, &schedule)?;
        let plain = estimate_clean(&x_t, &eps, 500, &schedule)?;
        assert_eq!(with_variance.dims(), &[1, 3, 4, 4]);
        assert_eq!(max_abs_diff(&with_variance, &plain)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_other_mismatches_are_fatal() -> Result<()> {
        let device = Device::Cpu;
        let x_t = Tensor::zeros((1, 4, 8, 8), DType::F32, &device)?;
        for eps in [
            Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?,
            Tensor::zeros((1, 8, 8, 4), DType::F32, &device)?,
            Tensor::zeros((2, 8, 8, 8), DType::F32, &device)?,
            Tensor::zeros((4, 8, 8), DType::F32, &device)?,
        ] {
            assert!(matches!(match_channels(&x_t, &eps), Err(SyncError::ShapeMismatch { .. })));
        }
        Ok(())
    }

    #[test]
    fn test_prediction_is_cast_to_sample_dtype() -> Result<()> {
        let device = Device::Cpu;
        let schedule = NoiseSchedule::new(&ScheduleConfig::stable_diffusion(), 10)?;
        let x_t = Tensor::ones((1, 4, 2, 2), DType::F32, &device)?;
        let eps = Tensor::ones((1, 4, 2, 2), DType::F16, &device)?;
        let x0 = estimate_clean(&x_t, &eps, 900, &schedule)?;
        assert_eq!(x0.dtype(), DType::F32);
        Ok(())
    }
}
