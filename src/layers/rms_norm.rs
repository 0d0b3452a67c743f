use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{init, Init, VarBuilder};
use std::sync::Arc;

use crate::ops::normalize::normalize;
use crate::ops::stats::{compute_stats, DeviceGroup, StatsOptions};

#[derive(Clone, Debug)]
pub struct RMSNormConfig {
    pub epsilon: f64,
    pub dtype: Option<DType>,
    pub use_scale: bool,
    pub scale_init: Init,
    pub reduction_axes: Vec<isize>,
    pub feature_axes: Vec<isize>,
    pub use_fast_variance: bool,
}

impl Default for RMSNormConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            dtype: None,
            use_scale: true,
            scale_init: init::ONE,
            reduction_axes: vec![-1],
            feature_axes: vec![-1],
            use_fast_variance: true,
        }
    }
}

/// RMS normalization: no re-centering, the input is divided by the root
/// mean square of the activations. There is no bias parameter.
pub struct RMSNorm {
    weight: Option<Tensor>,
    num_features: usize,
    epsilon: f64,
    dtype: Option<DType>,
    reduction_axes: Vec<isize>,
    feature_axes: Vec<isize>,
    use_fast_variance: bool,
    group: Option<Arc<dyn DeviceGroup + Send + Sync>>,
}

impl RMSNorm {
    pub fn new(num_features: usize, cfg: RMSNormConfig, vb: VarBuilder) -> Result<Self> {
        let weight = if cfg.use_scale {
            Some(vb.get_with_hints(num_features, "weight", cfg.scale_init)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            num_features,
            epsilon: cfg.epsilon,
            dtype: cfg.dtype,
            reduction_axes: cfg.reduction_axes,
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
        let opts = StatsOptions {
            dtype: self.dtype,
            use_mean: false,
            use_fast_variance: self.use_fast_variance,
            mask,
            group: self.group.as_deref().map(|g| g as &dyn DeviceGroup),
            ..StatsOptions::new()
        };
        let (mean, var) = compute_stats(x, &self.reduction_axes, opts)?;
        normalize(
            x,
            &mean,
            &var,
            self.weight.as_ref(),
            None,
            &self.reduction_axes,
            &self.feature_axes,
            self.dtype,
            self.epsilon,
        )
    }
}

impl Module for RMSNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with_mask(x, None)
    }
}
