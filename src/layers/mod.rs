//! Normalization layers.
//!
//! The standard layers pick reduction/feature axes and a statistic mode,
//! then defer to [`crate::ops::stats`] and [`crate::ops::normalize`]. The
//! wrapper layers rewrite another module's parameters before delegating.

pub mod batch_norm;
pub mod group_norm;
pub mod instance_norm;
pub mod layer_norm;
pub mod rms_norm;
pub mod spectral_norm;
pub mod weight_norm;

use candle_core::Var;
use candle_nn::VarMap;

/// Snapshot of a parameter store in deterministic (sorted-path) order.
pub(crate) fn sorted_vars(params: &VarMap) -> Vec<(String, Var)> {
    let data = params.data().lock().unwrap();
    let mut out: Vec<(String, Var)> = data
        .iter()
        .map(|(path, var)| (path.clone(), var.clone()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
