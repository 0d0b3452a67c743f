use candle_core::Result;

/// Maps possibly-negative axes onto `0..rank`, deduplicates and sorts them.
pub fn canonicalize_axes(rank: usize, axes: &[isize]) -> Result<Vec<usize>> {
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let resolved = if axis < 0 { axis + rank as isize } else { axis };
        if resolved < 0 || resolved >= rank as isize {
            candle_core::bail!(
                "axis {axis} is out of range for a tensor of rank {rank}"
            );
        }
        out.push(resolved as usize);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// The sorted axes of `0..rank` that are not in `axes`.
pub fn complement_axes(rank: usize, axes: &[usize]) -> Vec<usize> {
    (0..rank).filter(|a| !axes.contains(a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_negative_and_dedup() -> Result<()> {
        assert_eq!(canonicalize_axes(4, &[-1])?, vec![3]);
        assert_eq!(canonicalize_axes(4, &[2, -2, 0])?, vec![0, 2]);
        assert_eq!(canonicalize_axes(3, &[1, 1, -2])?, vec![1]);
        Ok(())
    }

    #[test]
    fn canonicalize_out_of_range() {
        assert!(canonicalize_axes(2, &[2]).is_err());
        assert!(canonicalize_axes(2, &[-3]).is_err());
    }

    #[test]
    fn complement() {
        assert_eq!(complement_axes(4, &[3]), vec![0, 1, 2]);
        assert_eq!(complement_axes(3, &[0, 2]), vec![1]);
        assert_eq!(complement_axes(2, &[]), vec![0, 1]);
    }
}
