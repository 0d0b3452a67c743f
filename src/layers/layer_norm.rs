use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{init, Init, VarBuilder};
use std::sync::Arc;

use crate::ops::normalize::normalize;
use crate::ops::stats::{compute_stats, DeviceGroup, StatsOptions};

#[derive(Clone, Debug)]
pub struct LayerNormConfig {
    pub epsilon: f64,
    /// Output dtype; inferred from input and parameters when `None`.
    pub dtype: Option<DType>,
    pub use_bias: bool,
    pub use_scale: bool,
    pub bias_init: Init,
    pub scale_init: Init,
    pub reduction_axes: Vec<isize>,
    pub feature_axes: Vec<isize>,
    pub use_fast_variance: bool,
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            dtype: None,
            use_bias: true,
            use_scale: true,
            bias_init: init::ZERO,
            scale_init: init::ONE,
            reduction_axes: vec![-1],
            feature_axes: vec![-1],
            use_fast_variance: true,
        }
    }
}

/// Layer normalization: statistics per example over the configured
/// reduction axes (default: the last).
pub struct LayerNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    num_features: usize,
    epsilon: f64,
    dtype: Option<DType>,
    reduction_axes: Vec<isize>,
    feature_axes: Vec<isize>,
    use_fast_variance: bool,
    group: Option<Arc<dyn DeviceGroup + Send + Sync>>,
}

impl LayerNorm {
    pub fn new(num_features: usize, cfg: LayerNormConfig, vb: VarBuilder) -> Result<Self> {
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
            reduction_axes: cfg.reduction_axes,
            feature_axes: cfg.feature_axes,
            use_fast_variance: cfg.use_fast_variance,
            group: None,
        })
    }

    /// Additionally pmean-average statistics across a device group.
    pub fn with_group(mut self, group: Arc<dyn DeviceGroup + Send + Sync>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Forward pass with positions excluded from the statistics wherever
    /// `mask` is zero.
    pub fn forward_with_mask(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let opts = StatsOptions {
            dtype: self.dtype,
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
            self.bias.as_ref(),
            &self.reduction_axes,
            &self.feature_axes,
            self.dtype,
            self.epsilon,
        )
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with_mask(x, None)
    }
}
