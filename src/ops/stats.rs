use candle_core::{DType, Result, Tensor};

use super::axes::canonicalize_axes;
use super::dtypes::stats_dtype;

/// A named group of devices that statistics are additionally averaged
/// across.
///
/// The crate ships no multi-device implementation; callers running under a
/// collective runtime plug one in. Every participant must call with the same
/// axis and group configuration, otherwise the collective mismatches — this
/// is a caller obligation and is not enforced here.
pub trait DeviceGroup {
    /// Mean-reduces across the group. `stacked` carries one statistic per
    /// leading-dim row so a single collective call covers all of them.
    fn pmean(&self, stacked: &Tensor) -> Result<Tensor>;
}

/// Options for [`compute_stats`].
#[derive(Clone, Copy)]
pub struct StatsOptions<'a> {
    /// Minimal precision for the statistics computation; the computation is
    /// always promoted to at least F32 (default: dtype of the input).
    pub dtype: Option<DType>,
    /// When false the mean is fixed at zero and the variance is the mean of
    /// the squared input (RMS mode).
    pub use_mean: bool,
    /// One combined pass using Var = E[x^2] - E[x]^2 instead of the slower
    /// two-pass Var = E[(x - E[x])^2]. Negative round-off is clamped to
    /// zero.
    pub use_fast_variance: bool,
    /// Positions where the mask is zero are excluded from both statistics.
    /// Must broadcast to the input's shape.
    pub mask: Option<&'a Tensor>,
    /// Cross-device averaging hook.
    pub group: Option<&'a dyn DeviceGroup>,
}

impl<'a> StatsOptions<'a> {
    pub fn new() -> Self {
        Self {
            dtype: None,
            use_mean: true,
            use_fast_variance: true,
            mask: None,
            group: None,
        }
    }
}

impl Default for StatsOptions<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean over `axes` (keepdim), optionally weighted by a broadcastable mask.
fn masked_mean(x: &Tensor, axes: &[usize], mask: Option<&Tensor>) -> Result<Tensor> {
    match mask {
        None => x.mean_keepdim(axes.to_vec()),
        Some(mask) => {
            let mask = mask.to_dtype(x.dtype())?.broadcast_as(x.dims())?;
            let weight = mask.sum_keepdim(axes.to_vec())?;
            let sum = x.broadcast_mul(&mask)?.sum_keepdim(axes.to_vec())?;
            sum.div(&weight)
        }
    }
}

/// Local means of `xs`, pmean-averaged across `group` when one is given.
/// Multiple statistics are stacked into a single collective call to keep
/// the synchronization overhead at one round trip.
fn group_means(
    xs: &[&Tensor],
    axes: &[usize],
    mask: Option<&Tensor>,
    group: Option<&dyn DeviceGroup>,
) -> Result<Vec<Tensor>> {
    let mus = xs
        .iter()
        .map(|x| masked_mean(x, axes, mask))
        .collect::<Result<Vec<_>>>()?;
    match group {
        None => Ok(mus),
        Some(group) => {
            let stacked = Tensor::stack(&mus, 0)?;
            let reduced = group.pmean(&stacked)?;
            (0..mus.len()).map(|i| reduced.get(i)).collect()
        }
    }
}

/// Computes mean and variance statistics over `axes`.
///
/// The computation is promoted to at least F32 to avoid half-precision
/// instability; the returned statistics carry that promoted dtype. Both
/// tensors are keepdim-shaped (size 1 on every reduction axis) so they
/// broadcast directly over the input.
pub fn compute_stats(x: &Tensor, axes: &[isize], opts: StatsOptions) -> Result<(Tensor, Tensor)> {
    let dtype = stats_dtype(x.dtype(), opts.dtype);
    let x = x.to_dtype(dtype)?;
    let axes = canonicalize_axes(x.rank(), axes)?;

    if !opts.use_mean {
        let var = group_means(&[&x.sqr()?], &axes, opts.mask, opts.group)?.remove(0);
        let mean = var.zeros_like()?;
        return Ok((mean, var));
    }

    if opts.use_fast_variance {
        let mut mus = group_means(&[&x, &x.sqr()?], &axes, opts.mask, opts.group)?;
        let mu2 = mus.remove(1);
        let mu = mus.remove(0);
        // E[x^2] - E[x]^2 can go slightly negative from round-off; clamp to
        // zero to avoid NaNs downstream.
        let var = (mu2 - mu.sqr()?)?.relu()?;
        Ok((mu, var))
    } else {
        let mu = group_means(&[&x], &axes, opts.mask, opts.group)?.remove(0);
        let centered = x.broadcast_sub(&mu)?;
        let var = group_means(&[&centered.sqr()?], &axes, opts.mask, opts.group)?.remove(0);
        Ok((mu, var))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::cell::Cell;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn fast_and_two_pass_agree() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 3.0, (4, 5, 6), &device)?;
        let fast = StatsOptions { use_fast_variance: true, ..StatsOptions::new() };
        let slow = StatsOptions { use_fast_variance: false, ..StatsOptions::new() };
        let (m1, v1) = compute_stats(&x, &[0, 1], fast)?;
        let (m2, v2) = compute_stats(&x, &[0, 1], slow)?;
        assert!(max_diff(&m1, &m2)? < 1e-5);
        assert!(max_diff(&v1, &v2)? < 1e-4);
        Ok(())
    }

    #[test]
    fn fast_variance_never_negative() -> Result<()> {
        let device = Device::Cpu;
        // Large offset with tiny spread provokes catastrophic cancellation
        // in the single-pass formula.
        let noise = Tensor::randn(0f32, 1e-3, (8, 16), &device)?;
        let x = (noise + 10_000.0)?;
        let (_, var) = compute_stats(&x, &[-1], StatsOptions::new())?;
        let min = var.neg()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(min <= 0.0, "variance went negative: {}", -min);
        Ok(())
    }

    #[test]
    fn rms_mode_zero_mean() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, -2.0, 3.0]], &device)?;
        let opts = StatsOptions { use_mean: false, ..StatsOptions::new() };
        let (mean, var) = compute_stats(&x, &[-1], opts)?;
        assert_eq!(mean.flatten_all()?.to_vec1::<f32>()?, vec![0.0]);
        let expected = (1.0 + 4.0 + 9.0) / 3.0;
        let got = var.flatten_all()?.to_vec1::<f32>()?[0];
        assert!((got - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn masked_stats_match_filtered_subset() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (5, 6), &device)?;
        // Select rows 0, 2 and 4.
        let mask = Tensor::new(&[[1u8], [0], [1], [0], [1]], &device)?;
        let opts = StatsOptions { mask: Some(&mask), ..StatsOptions::new() };
        let (mean, var) = compute_stats(&x, &[0], opts)?;

        let subset = Tensor::cat(
            &[x.narrow(0, 0, 1)?, x.narrow(0, 2, 1)?, x.narrow(0, 4, 1)?],
            0,
        )?;
        let (mean_ref, var_ref) = compute_stats(&subset, &[0], StatsOptions::new())?;
        assert!(max_diff(&mean, &mean_ref)? < 1e-5);
        assert!(max_diff(&var, &var_ref)? < 1e-5);
        Ok(())
    }

    /// Group that leaves values untouched but records how many statistics
    /// each collective call carried.
    struct Recorder {
        calls: Cell<usize>,
        rows: Cell<usize>,
    }

    impl DeviceGroup for Recorder {
        fn pmean(&self, stacked: &Tensor) -> Result<Tensor> {
            self.calls.set(self.calls.get() + 1);
            self.rows.set(stacked.dims()[0]);
            Ok(stacked.clone())
        }
    }

    #[test]
    fn grouped_stats_use_one_stacked_collective() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let recorder = Recorder { calls: Cell::new(0), rows: Cell::new(0) };
        let opts = StatsOptions { group: Some(&recorder), ..StatsOptions::new() };
        let (mean, var) = compute_stats(&x, &[0], opts)?;
        let (mean_ref, var_ref) = compute_stats(&x, &[0], StatsOptions::new())?;
        assert_eq!(recorder.calls.get(), 1);
        assert_eq!(recorder.rows.get(), 2);
        assert!(max_diff(&mean, &mean_ref)? < 1e-6);
        assert!(max_diff(&var, &var_ref)? < 1e-6);
        Ok(())
    }

    #[test]
    fn half_precision_promoted_to_f32() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3), &device)?.to_dtype(DType::F16)?;
        let (mean, var) = compute_stats(&x, &[-1], StatsOptions::new())?;
        assert_eq!(mean.dtype(), DType::F32);
        assert_eq!(var.dtype(), DType::F32);
        Ok(())
    }
}
