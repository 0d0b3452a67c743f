use candle_core::{Result, Tensor};

use super::axes::canonicalize_axes;

/// Normalizes `x` along `axes` using an L2 norm:
/// `x * rsqrt(sum(x^2, axes) + eps)`.
///
/// Passing `None` for `axes` treats `x` as one flattened vector (Frobenius
/// norm). The reduced norm broadcasts back over `x`, so the result has the
/// same shape as the input.
pub fn l2_normalize(x: &Tensor, axes: Option<&[isize]>, eps: f64) -> Result<Tensor> {
    let sum_sq = match axes {
        None => x.sqr()?.sum_all()?,
        Some(axes) => {
            let axes = canonicalize_axes(x.rank(), axes)?;
            x.sqr()?.sum_keepdim(axes)?
        }
    };
    let norm = (sum_sq + eps)?.sqrt()?;
    x.broadcast_div(&norm)
}
