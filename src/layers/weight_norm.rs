use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{init, Init, VarMap};

use super::sorted_vars;
use crate::ops::axes::{canonicalize_axes, complement_axes};
use crate::ops::dtypes::result_dtype;
use crate::ops::l2::l2_normalize;

#[derive(Clone, Debug)]
pub struct WeightNormConfig {
    pub epsilon: f64,
    /// Output dtype of the rewritten values before they are cast back to
    /// each parameter's storage dtype.
    pub dtype: Option<DType>,
    /// Dtype of the lazily created scale parameters.
    pub param_dtype: DType,
    pub use_scale: bool,
    pub scale_init: Init,
    /// Axes of each parameter that keep their own norm; the L2 norm is taken
    /// over the remaining axes. `None` normalizes each parameter as one
    /// flattened vector with a single scalar scale.
    pub feature_axes: Option<Vec<isize>>,
    /// Only parameters whose dotted path contains one of these segments are
    /// rewritten. `None` rewrites every parameter.
    pub filters: Option<Vec<String>>,
}

impl Default for WeightNormConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            dtype: None,
            param_dtype: DType::F32,
            use_scale: true,
            scale_init: init::ONE,
            feature_axes: Some(vec![-1]),
            filters: Some(vec!["weight".to_string()]),
        }
    }
}

/// Weight normalization wrapper: reparameterizes the inner module's selected
/// parameters as a direction (unit L2 norm over the non-feature axes) times
/// a learnable per-feature scale.
///
/// The rewrite happens in the inner module's live `VarMap` on every forward
/// call, so modules built from a `VarBuilder` over that map observe the
/// normalized values. Scales are created lazily on the first call, keyed as
/// `<param path>.scale`.
pub struct WeightNorm<M: Module> {
    inner: M,
    params: VarMap,
    scales: VarMap,
    epsilon: f64,
    dtype: Option<DType>,
    param_dtype: DType,
    use_scale: bool,
    scale_init: Init,
    feature_axes: Option<Vec<isize>>,
    filters: Option<Vec<String>>,
}

impl<M: Module> WeightNorm<M> {
    /// `params` must be the `VarMap` that `inner`'s parameters live in.
    pub fn new(inner: M, params: VarMap, cfg: WeightNormConfig) -> Self {
        Self {
            inner,
            params,
            scales: VarMap::new(),
            epsilon: cfg.epsilon,
            dtype: cfg.dtype,
            param_dtype: cfg.param_dtype,
            use_scale: cfg.use_scale,
            scale_init: cfg.scale_init,
            feature_axes: cfg.feature_axes,
            filters: cfg.filters,
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// The lazily created scale parameters.
    pub fn scales(&self) -> &VarMap {
        &self.scales
    }

    fn matches_filter(&self, path: &str) -> bool {
        match &self.filters {
            Some(filters) => path.split('.').any(|seg| filters.iter().any(|f| f == seg)),
            None => true,
        }
    }

    fn rewrite_params(&self) -> Result<()> {
        for (path, var) in sorted_vars(&self.params) {
            if !self.matches_filter(&path) {
                continue;
            }
            let value = var.as_tensor();
            let rank = value.rank();
            let dims = value.dims();

            let features = match &self.feature_axes {
                Some(axes) => canonicalize_axes(rank, axes)?,
                None => Vec::new(),
            };
            let reduction: Vec<isize> = complement_axes(rank, &features)
                .into_iter()
                .map(|a| a as isize)
                .collect();

            let mut value_bar = if reduction.is_empty() {
                value.clone()
            } else {
                l2_normalize(value, Some(&reduction), self.epsilon)?
            };

            let mut parts = vec![value.dtype()];
            if self.use_scale {
                let feature_sizes: Vec<usize> = features.iter().map(|&a| dims[a]).collect();
                let name = format!("{path}.scale");
                if !self.scales.data().lock().unwrap().contains_key(&name) {
                    log::debug!("creating weight-norm scale `{name}` with shape {feature_sizes:?}");
                }
                let scale = self.scales.get(
                    feature_sizes,
                    &name,
                    self.scale_init,
                    self.param_dtype,
                    value.device(),
                )?;
                parts.push(scale.dtype());
                let compute_dtype = result_dtype(&parts, self.dtype);

                let mut broadcast_shape = vec![1usize; rank];
                for &a in &features {
                    broadcast_shape[a] = dims[a];
                }
                value_bar = value_bar
                    .to_dtype(compute_dtype)?
                    .broadcast_mul(&scale.to_dtype(compute_dtype)?.reshape(broadcast_shape)?)?;
            } else {
                let compute_dtype = result_dtype(&parts, self.dtype);
                value_bar = value_bar.to_dtype(compute_dtype)?;
            }

            // Vars can only hold their original dtype.
            var.set(&value_bar.to_dtype(value.dtype())?)?;
        }
        Ok(())
    }
}

impl<M: Module> Module for WeightNorm<M> {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.rewrite_params()?;
        self.inner.forward(x)
    }
}
