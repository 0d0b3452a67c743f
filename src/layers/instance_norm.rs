use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{init, Init, VarBuilder};
use std::sync::Arc;

use crate::ops::axes::canonicalize_axes;
use crate::ops::normalize::normalize;
use crate::ops::stats::{compute_stats, DeviceGroup, StatsOptions};

#[derive(Clone, Debug)]
pub struct InstanceNormConfig {
    pub epsilon: f64,
    pub dtype: Option<DType>,
    pub use_bias: bool,
    pub use_scale: bool,
    pub bias_init: Init,
    pub scale_init: Init,
    /// Feature axes; the leading axis is reserved as the batch axis and may
    /// not appear here.
    pub feature_axes: Vec<isize>,
    pub use_fast_variance: bool,
}

impl Default for InstanceNormConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            dtype: None,
            use_bias: true,
            use_scale: true,
            bias_init: init::ZERO,
            scale_init: init::ONE,
            feature_axes: vec![-1],
            use_fast_variance: true,
        }
    }
}

/// Instance normalization: statistics per channel and per example, reduced
/// over every non-batch, non-feature axis.
pub struct InstanceNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    num_features: usize,
    epsilon: f64,
    dtype: Option<DType>,
    feature_axes: Vec<isize>,
    use_fast_variance: bool,
    group: Option<Arc<dyn DeviceGroup + Send + Sync>>,
}

impl InstanceNorm {
    pub fn new(num_features: usize, cfg: InstanceNormConfig, vb: VarBuilder) -> Result<Self> {
        let weight = if cfg.use_scale {
            Some(vb.get_with_hints(num_features, "weight", cfg.scale_init)?)
        } else {
            None
        };
        let bias = if cfg.use_bias {
            Some(vb.get_with_hints(num_features, "bias", cfg.bias_init)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            num_features,
            epsilon: cfg.epsilon,
            dtype: cfg.dtype,
            feature_axes: cfg.feature_axes,
            use_fast_variance: cfg.use_fast_variance,
            group: None,
        })
    }

    pub fn with_group(mut self, group: Arc<dyn DeviceGroup + Send + Sync>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn forward_with_mask(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let rank = x.rank();
        let features = canonicalize_axes(rank, &self.feature_axes)?;
        if features.contains(&0) {
            candle_core::bail!(
                "the feature axes cannot include the leading dimension, which is \
                 assumed to be the batch axis"
            );
        }
        let reduction: Vec<isize> = (1..rank)
            .filter(|a| !features.contains(a))
            .map(|a| a as isize)
            .collect();
        let features: Vec<isize> = features.into_iter().map(|a| a as isize).collect();

        let opts = StatsOptions {
            dtype: self.dtype,
            use_fast_variance: self.use_fast_variance,
            mask,
            group: self.group.as_deref().map(|g| g as &dyn DeviceGroup),
            ..StatsOptions::new()
        };
        let (mean, var) = compute_stats(x, &reduction, opts)?;
        normalize(
            x,
            &mean,
            &var,
            self.weight.as_ref(),
            self.bias.as_ref(),
            &reduction,
            &features,
            self.dtype,
            self.epsilon,
        )
    }
}

impl Module for InstanceNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with_mask(x, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn batch_axis_cannot_be_a_feature() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = InstanceNormConfig {
            feature_axes: vec![0],
            ..Default::default()
        };
        let inorm = InstanceNorm::new(4, cfg, vb)?;
        let x = Tensor::randn(0f32, 1.0, (4, 5, 6), &device)?;
        assert!(inorm.forward(&x).is_err());
        Ok(())
    }
}
