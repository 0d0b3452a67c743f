//! Tensor-level building blocks shared by every normalization layer.

pub mod axes;
pub mod dtypes;
pub mod l2;
pub mod normalize;
pub mod stats;
