use candle_core::DType;

/// Common-type promotion for a pair of dtypes.
///
/// F64 dominates, then F32. Mixing the two half-precision types promotes to
/// F32 since neither can represent the other. Integer dtypes promote to F32.
pub fn promote(a: DType, b: DType) -> DType {
    use DType::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (F64, _) | (_, F64) => F64,
        (F32, _) | (_, F32) => F32,
        (BF16, F16) | (F16, BF16) => F32,
        (BF16, _) | (_, BF16) => BF16,
        (F16, _) | (_, F16) => F16,
        _ => F32,
    }
}

/// Output dtype rule shared by the normalize primitive and the wrapper
/// layers: an explicitly requested dtype wins, otherwise the promotion of
/// every participating tensor's dtype.
pub fn result_dtype(parts: &[DType], requested: Option<DType>) -> DType {
    match requested {
        Some(dtype) => dtype,
        None => parts
            .iter()
            .copied()
            .reduce(promote)
            .unwrap_or(DType::F32),
    }
}

/// Statistics are computed in at least 32-bit precision regardless of the
/// input dtype; double precision is preserved.
pub fn stats_dtype(x: DType, requested: Option<DType>) -> DType {
    promote(requested.unwrap_or(x), DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType::*;

    #[test]
    fn promotion_pairs() {
        assert_eq!(promote(F32, F32), F32);
        assert_eq!(promote(F16, F64), F64);
        assert_eq!(promote(BF16, F32), F32);
        assert_eq!(promote(BF16, F16), F32);
        assert_eq!(promote(F16, F16), F16);
        assert_eq!(promote(U8, F16), F16);
    }

    #[test]
    fn requested_dtype_wins() {
        assert_eq!(result_dtype(&[F32, F64], Some(F16)), F16);
        assert_eq!(result_dtype(&[F16, BF16], None), F32);
        assert_eq!(result_dtype(&[F16], None), F16);
    }

    #[test]
    fn stats_at_least_f32() {
        assert_eq!(stats_dtype(F16, None), F32);
        assert_eq!(stats_dtype(BF16, None), F32);
        assert_eq!(stats_dtype(F32, None), F32);
        assert_eq!(stats_dtype(F64, None), F64);
        assert_eq!(stats_dtype(F16, Some(F64)), F64);
    }
}
