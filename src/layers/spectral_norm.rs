use candle_core::{DType, Module, Result, Tensor, Var};
use candle_nn::VarMap;

use super::sorted_vars;
use crate::ops::dtypes::promote;
use crate::ops::l2::l2_normalize;
use crate::rng::RngSource;

#[derive(Clone, Debug)]
pub struct SpectralNormConfig {
    /// Power-iteration steps per forward call.
    pub n_steps: usize,
    pub epsilon: f64,
    /// Dtype of the persisted `u`/`sigma` state.
    pub param_dtype: DType,
    /// Fail on parameters with more than two axes instead of flattening
    /// them into a matrix over the trailing axis.
    pub error_on_non_matrix: bool,
    /// Collection prefix for the persisted state keys.
    pub collection_name: String,
}

impl Default for SpectralNormConfig {
    fn default() -> Self {
        Self {
            n_steps: 1,
            epsilon: 1e-12,
            param_dtype: DType::F32,
            error_on_non_matrix: false,
            collection_name: "batch_stats".to_string(),
        }
    }
}

/// Spectral normalization wrapper: divides each of the inner module's
/// matrix-shaped parameters by an estimate of its largest singular value,
/// refined by power iteration on every forward call.
///
/// The left singular vector estimate `u` and the current `sigma` persist in
/// a separate stats map under `<collection>/<param path>/u` and `/sigma`;
/// they are only written back when `update_stats` is true, so evaluation
/// passes leave the estimate frozen.
pub struct SpectralNorm<M: Module> {
    inner: M,
    params: VarMap,
    stats: VarMap,
    rng: RngSource,
    n_steps: usize,
    epsilon: f64,
    param_dtype: DType,
    error_on_non_matrix: bool,
    collection_name: String,
}

impl<M: Module> SpectralNorm<M> {
    /// `params` must be the `VarMap` that `inner`'s parameters live in; the
    /// `rng` seeds the initial `u` vectors.
    pub fn new(inner: M, params: VarMap, rng: RngSource, cfg: SpectralNormConfig) -> Self {
        Self {
            inner,
            params,
            stats: VarMap::new(),
            rng,
            n_steps: cfg.n_steps,
            epsilon: cfg.epsilon,
            param_dtype: cfg.param_dtype,
            error_on_non_matrix: cfg.error_on_non_matrix,
            collection_name: cfg.collection_name,
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// The persisted power-iteration state.
    pub fn stats(&self) -> &VarMap {
        &self.stats
    }

    fn stat_key(&self, path: &str, leaf: &str) -> String {
        format!("{}/{}/{leaf}", self.collection_name, path.replace('.', "/"))
    }

    fn load_stat(&self, key: &str) -> Option<Tensor> {
        let data = self.stats.data().lock().unwrap();
        data.get(key).map(|v| v.as_tensor().clone())
    }

    fn store_stat(&self, key: &str, value: &Tensor) -> Result<()> {
        let value = value.to_dtype(self.param_dtype)?;
        let mut data = self.stats.data().lock().unwrap();
        match data.get(key) {
            Some(var) => var.set(&value)?,
            None => {
                data.insert(key.to_string(), Var::from_tensor(&value)?);
            }
        }
        Ok(())
    }

    fn rewrite_params(&self, update_stats: bool) -> Result<()> {
        for (path, var) in sorted_vars(&self.params) {
            let value = var.as_tensor();
            let rank = value.rank();
            if rank <= 1 || self.n_steps == 0 {
                continue;
            }
            let dims = value.dims().to_vec();
            let cols = dims[rank - 1];
            let w = if rank > 2 {
                if self.error_on_non_matrix {
                    candle_core::bail!(
                        "parameter `{path}` has {rank} axes and cannot be spectrally \
                         normalized as a matrix"
                    );
                }
                value.reshape((value.elem_count() / cols, cols))?
            } else {
                value.clone()
            };

            let iter_dtype = promote(w.dtype(), DType::F32);
            let wf = w.to_dtype(iter_dtype)?;
            let u_key = self.stat_key(&path, "u");
            let sigma_key = self.stat_key(&path, "sigma");
            let mut u = match self.load_stat(&u_key) {
                Some(u) => u.to_dtype(iter_dtype)?,
                None => {
                    log::debug!("initializing spectral-norm state `{u_key}`");
                    self.rng
                        .normal((1, cols), self.param_dtype, value.device())?
                        .to_dtype(iter_dtype)?
                }
            };

            let wt = wf.t()?.contiguous()?;
            let mut v = l2_normalize(&u.matmul(&wt)?, None, self.epsilon)?;
            u = l2_normalize(&v.matmul(&wf)?, None, self.epsilon)?;
            for _ in 1..self.n_steps {
                v = l2_normalize(&u.matmul(&wt)?, None, self.epsilon)?;
                u = l2_normalize(&v.matmul(&wf)?, None, self.epsilon)?;
            }
            // The estimate itself is not differentiated through.
            u = u.detach();
            v = v.detach();

            let sigma = v
                .matmul(&wf)?
                .matmul(&u.t()?.contiguous()?)?
                .squeeze(0)?
                .squeeze(0)?;
            let sigma_val = sigma.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            let denom = if sigma_val == 0.0 { 1.0 } else { sigma_val as f64 };

            var.set(&(value / denom)?)?;
            if update_stats {
                self.store_stat(&u_key, &u)?;
                self.store_stat(&sigma_key, &sigma)?;
            }
        }
        Ok(())
    }

    /// Forward pass; when `update_stats` is true the refined `u`/`sigma`
    /// estimates are written back to the stats map.
    pub fn forward_with(&self, x: &Tensor, update_stats: bool) -> Result<Tensor> {
        self.rewrite_params(update_stats)?;
        self.inner.forward(x)
    }
}

impl<M: Module> Module for SpectralNorm<M> {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with(x, false)
    }
}
