//! Normalization layers for [candle](https://github.com/huggingface/candle).
//!
//! The standard layers (`BatchNorm`, `LayerNorm`, `RMSNorm`, `GroupNorm`,
//! `InstanceNorm`) are thin axis policies over a shared statistics engine
//! ([`ops::stats::compute_stats`]) and normalize primitive
//! ([`ops::normalize::normalize`]). The wrapper layers (`WeightNorm`,
//! `SpectralNorm`) rewrite another module's parameters in its live `VarMap`
//! before delegating the forward call.
//!
//! ```no_run
//! use candle_core::{DType, Device, Module, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use candle_norm::{LayerNorm, LayerNormConfig};
//!
//! # fn main() -> candle_core::Result<()> {
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let ln = LayerNorm::new(8, LayerNormConfig::default(), vb)?;
//! let x = Tensor::randn(0f32, 1.0, (4, 8), &device)?;
//! let y = ln.forward(&x)?;
//! # Ok(())
//! # }
//! ```

pub mod layers;
pub mod ops;
pub mod rng;

pub use layers::batch_norm::{BatchNorm, BatchNormConfig};
pub use layers::group_norm::{GroupNorm, GroupNormConfig};
pub use layers::instance_norm::{InstanceNorm, InstanceNormConfig};
pub use layers::layer_norm::{LayerNorm, LayerNormConfig};
pub use layers::rms_norm::{RMSNorm, RMSNormConfig};
pub use layers::spectral_norm::{SpectralNorm, SpectralNormConfig};
pub use layers::weight_norm::{WeightNorm, WeightNormConfig};
pub use ops::l2::l2_normalize;
pub use ops::normalize::normalize;
pub use ops::stats::{compute_stats, DeviceGroup, StatsOptions};
pub use rng::RngSource;
