use candle_core::{DType, Module, Result, Tensor, Var};
use candle_nn::{init, Init, VarBuilder};
use std::sync::Arc;

use crate::ops::axes::{canonicalize_axes, complement_axes};
use crate::ops::normalize::normalize;
use crate::ops::stats::{compute_stats, DeviceGroup, StatsOptions};

#[derive(Clone, Debug)]
pub struct BatchNormConfig {
    /// Layer-level mode: `Some(true)` reads the stored running statistics,
    /// `Some(false)` computes batch statistics and updates the buffers. The
    /// per-call argument takes precedence; if neither supplies a value the
    /// call fails.
    pub use_running_average: Option<bool>,
    /// The feature (non-batch) axis of the input.
    pub axis: isize,
    /// Decay rate for the exponential moving average of the batch
    /// statistics.
    pub momentum: f64,
    pub epsilon: f64,
    pub dtype: Option<DType>,
    pub use_bias: bool,
    pub use_scale: bool,
    pub bias_init: Init,
    pub scale_init: Init,
    pub use_fast_variance: bool,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            use_running_average: None,
            axis: -1,
            momentum: 0.99,
            epsilon: 1e-5,
            dtype: None,
            use_bias: true,
            use_scale: true,
            bias_init: init::ZERO,
            scale_init: init::ONE,
            use_fast_variance: true,
        }
    }
}

/// Batch normalization with exponentially averaged running statistics.
///
/// The running buffers live in F32 `Var`s owned by the layer; they are
/// updated in place on every non-running-mode call and only ever reset by
/// rebuilding the layer.
pub struct BatchNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    running_mean: Var,
    running_var: Var,
    num_features: usize,
    axis: isize,
    momentum: f64,
    epsilon: f64,
    dtype: Option<DType>,
    use_running_average: Option<bool>,
    use_fast_variance: bool,
    group: Option<Arc<dyn DeviceGroup + Send + Sync>>,
}

impl BatchNorm {
    pub fn new(num_features: usize, cfg: BatchNormConfig, vb: VarBuilder) -> Result<Self> {
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
        let device = vb.device();
        let running_mean = Var::from_tensor(&Tensor::zeros(num_features, DType::F32, device)?)?;
        let running_var = Var::from_tensor(&Tensor::ones(num_features, DType::F32, device)?)?;
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            num_features,
            axis: cfg.axis,
            momentum: cfg.momentum,
            epsilon: cfg.epsilon,
            dtype: cfg.dtype,
            use_running_average: cfg.use_running_average,
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

    pub fn running_mean(&self) -> &Var {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Var {
        &self.running_var
    }

    /// Normalizes `x`, with the per-call `use_running_average` taking
    /// precedence over the layer configuration.
    ///
    /// In non-running mode the freshly computed batch statistics normalize
    /// this call's output, and the running buffers are blended as
    /// `momentum * old + (1 - momentum) * new` as a side effect.
    pub fn forward_with(
        &self,
        x: &Tensor,
        use_running_average: Option<bool>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let use_running = match use_running_average.or(self.use_running_average) {
            Some(v) => v,
            None => candle_core::bail!(
                "no `use_running_average` was provided to BatchNorm, either as a \
                 call argument or in the layer configuration"
            ),
        };
        let features = canonicalize_axes(x.rank(), &[self.axis])?;
        let reduction: Vec<isize> = complement_axes(x.rank(), &features)
            .into_iter()
            .map(|a| a as isize)
            .collect();
        let features: Vec<isize> = features.into_iter().map(|a| a as isize).collect();

        let (mean, var) = if use_running {
            (
                self.running_mean.as_tensor().clone(),
                self.running_var.as_tensor().clone(),
            )
        } else {
            let opts = StatsOptions {
                dtype: self.dtype,
                use_fast_variance: self.use_fast_variance,
                mask,
                group: self.group.as_deref().map(|g| g as &dyn DeviceGroup),
                ..StatsOptions::new()
            };
            let (mean, var) = compute_stats(x, &reduction, opts)?;

            let m = self.momentum;
            let batch_mean = mean.flatten_all()?.to_dtype(DType::F32)?;
            let batch_var = var.flatten_all()?.to_dtype(DType::F32)?;
            self.running_mean.set(
                &((self.running_mean.as_tensor() * m)? + (batch_mean * (1.0 - m))?)?,
            )?;
            self.running_var.set(
                &((self.running_var.as_tensor() * m)? + (batch_var * (1.0 - m))?)?,
            )?;
            (mean, var)
        };

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

impl Module for BatchNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with(x, None, None)
    }
}
