use candle_core::{DType, Result, Tensor};

use super::axes::canonicalize_axes;
use super::dtypes::{promote, result_dtype, stats_dtype};

/// Applies `(x - mean) * rsqrt(var + eps)` with an optional learned scale
/// and bias.
///
/// `mean`/`var` are reshaped to broadcast over the reduction axes (size 1
/// there, the input's size elsewhere); either reduced or keepdim statistics
/// are accepted since the element counts agree. `scale`/`bias` are reshaped
/// to broadcast over the feature axes only. The scale folds into the
/// rsqrt multiplier so the input is multiplied once.
///
/// The output dtype is the promotion of the participating tensors' dtypes
/// unless `dtype` is given, in which case it wins.
#[allow(clippy::too_many_arguments)]
pub fn normalize(
    x: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    scale: Option<&Tensor>,
    bias: Option<&Tensor>,
    reduction_axes: &[isize],
    feature_axes: &[isize],
    dtype: Option<DType>,
    epsilon: f64,
) -> Result<Tensor> {
    let rank = x.rank();
    let reduction = canonicalize_axes(rank, reduction_axes)?;
    let features = canonicalize_axes(rank, feature_axes)?;

    let mut stats_shape = x.dims().to_vec();
    for &axis in &reduction {
        stats_shape[axis] = 1;
    }
    let mut feature_shape = vec![1usize; rank];
    for &axis in &features {
        feature_shape[axis] = x.dims()[axis];
    }

    let compute_dtype = promote(mean.dtype(), stats_dtype(x.dtype(), None));
    let mean = mean.reshape(stats_shape.clone())?.to_dtype(compute_dtype)?;
    let var = var.reshape(stats_shape)?.to_dtype(compute_dtype)?;

    let mut parts = vec![x.dtype()];
    let y = x.to_dtype(compute_dtype)?.broadcast_sub(&mean)?;
    let mut mul = (var + epsilon)?.sqrt()?.recip()?;
    if let Some(scale) = scale {
        parts.push(scale.dtype());
        let scale = scale.reshape(feature_shape.clone())?.to_dtype(compute_dtype)?;
        mul = mul.broadcast_mul(&scale)?;
    }
    let mut y = y.broadcast_mul(&mul)?;
    if let Some(bias) = bias {
        parts.push(bias.dtype());
        let bias = bias.reshape(feature_shape)?.to_dtype(compute_dtype)?;
        y = y.broadcast_add(&bias)?;
    }
    y.to_dtype(result_dtype(&parts, dtype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::stats::{compute_stats, StatsOptions};
    use candle_core::Device;

    #[test]
    fn matches_manual_standardization() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0], [4.0, 6.0, 8.0]], &device)?;
        let (mean, var) = compute_stats(&x, &[-1], StatsOptions::new())?;
        let y = normalize(&x, &mean, &var, None, None, &[-1], &[-1], None, 0.0)?;
        let rows = y.to_vec2::<f32>()?;
        // Row 0: mean 2, var 2/3.
        let s = (2.0f32 / 3.0).sqrt();
        assert!((rows[0][0] + 1.0 / s).abs() < 1e-5);
        assert!((rows[0][1]).abs() < 1e-5);
        assert!((rows[0][2] - 1.0 / s).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn scale_and_bias_broadcast_over_features() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 4), &device)?;
        let (mean, var) = compute_stats(&x, &[-1], StatsOptions::new())?;
        let scale = Tensor::new(&[2.0f32, 2.0, 2.0, 2.0], &device)?;
        let bias = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0], &device)?;
        let plain = normalize(&x, &mean, &var, None, None, &[-1], &[-1], None, 1e-6)?;
        let scaled = normalize(
            &x, &mean, &var, Some(&scale), Some(&bias), &[-1], &[-1], None, 1e-6,
        )?;
        let expected = ((plain * 2.0)? + 1.0)?;
        let diff = (scaled - expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn output_dtype_promotion() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 4), &device)?.to_dtype(DType::F16)?;
        let (mean, var) = compute_stats(&x, &[-1], StatsOptions::new())?;
        let y = normalize(&x, &mean, &var, None, None, &[-1], &[-1], None, 1e-6)?;
        assert_eq!(y.dtype(), DType::F16);

        let scale = Tensor::ones(4, DType::F32, &device)?;
        let y = normalize(&x, &mean, &var, Some(&scale), None, &[-1], &[-1], None, 1e-6)?;
        assert_eq!(y.dtype(), DType::F32);

        let y = normalize(
            &x, &mean, &var, Some(&scale), None, &[-1], &[-1], Some(DType::F16), 1e-6,
        )?;
        assert_eq!(y.dtype(), DType::F16);
        Ok(())
    }
}
