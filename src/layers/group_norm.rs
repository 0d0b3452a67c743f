use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{init, Init, VarBuilder};
use std::sync::Arc;

use crate::ops::axes::canonicalize_axes;
use crate::ops::normalize::normalize;
use crate::ops::stats::{compute_stats, DeviceGroup, StatsOptions};

#[derive(Clone, Debug)]
pub struct GroupNormConfig {
    pub epsilon: f64,
    pub dtype: Option<DType>,
    pub use_bias: bool,
    pub use_scale: bool,
    pub bias_init: Init,
    pub scale_init: Init,
    /// Axes for computing normalization statistics. The channel axis (the
    /// last one) is always treated as grouped. Default: every non-leading
    /// axis, the leading one being the batch axis.
    pub reduction_axes: Option<Vec<isize>>,
    pub use_fast_variance: bool,
}

impl Default for GroupNormConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            dtype: None,
            use_bias: true,
            use_scale: true,
            bias_init: init::ZERO,
            scale_init: init::ONE,
            reduction_axes: None,
            use_fast_variance: true,
        }
    }
}

/// Group normalization: statistics shared across equally-sized groups of
/// channels, never across the batch dimension.
///
/// With `num_groups = 1` this matches LayerNorm reducing over the same
/// axes.
pub struct GroupNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    num_features: usize,
    num_groups: usize,
    group_size: usize,
    epsilon: f64,
    dtype: Option<DType>,
    reduction_axes: Option<Vec<isize>>,
    use_fast_variance: bool,
    group: Option<Arc<dyn DeviceGroup + Send + Sync>>,
}

impl GroupNorm {
    /// Exactly one of `num_groups`/`group_size` must be given, and it must
    /// divide the channel count evenly.
    pub fn new(
        num_features: usize,
        num_groups: Option<usize>,
        group_size: Option<usize>,
        cfg: GroupNormConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (num_groups, group_size) = match (num_groups, group_size) {
            (Some(_), Some(_)) | (None, None) => candle_core::bail!(
                "either `num_groups` or `group_size` should be specified, but not both"
            ),
            (Some(groups), None) => {
                if groups == 0 || num_features % groups != 0 {
                    candle_core::bail!(
                        "number of groups ({groups}) does not divide the number of \
                         channels ({num_features})"
                    );
                }
                (groups, num_features / groups)
            }
            (None, Some(size)) => {
                if size == 0 || num_features % size != 0 {
                    candle_core::bail!(
                        "number of channels ({num_features}) is not a multiple of the \
                         group size ({size})"
                    );
                }
                (num_features / size, size)
            }
        };
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
            num_groups,
            group_size,
            epsilon: cfg.epsilon,
            dtype: cfg.dtype,
            reduction_axes: cfg.reduction_axes,
            use_fast_variance: cfg.use_fast_variance,
            group: None,
        })
    }

    pub fn with_group(mut self, group: Arc<dyn DeviceGroup + Send + Sync>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn forward_with_mask(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let rank = x.rank();
        let dims = x.dims();
        if dims[rank - 1] != self.num_features {
            candle_core::bail!(
                "expected {} channels in the trailing axis, got {}",
                self.num_features,
                dims[rank - 1]
            );
        }
        let reduction = match &self.reduction_axes {
            Some(axes) => canonicalize_axes(rank, axes)?,
            None => (1..rank).collect(),
        };

        // Split the channel axis into (groups, group_size) and compute
        // statistics per group.
        let mut grouped_shape = dims[..rank - 1].to_vec();
        grouped_shape.push(self.num_groups);
        grouped_shape.push(self.group_size);
        let grouped = x.reshape(grouped_shape.clone())?;
        let grouped_mask = match mask {
            Some(mask) => Some(
                mask.broadcast_as(dims)?
                    .contiguous()?
                    .reshape(grouped_shape)?,
            ),
            None => None,
        };
        // The channel axis maps onto the trailing group-size axis; every
        // other reduction axis keeps its index.
        let mut grouped_reduction: Vec<isize> = reduction
            .iter()
            .filter(|&&a| a != rank - 1)
            .map(|&a| a as isize)
            .collect();
        grouped_reduction.push(-1);

        let opts = StatsOptions {
            dtype: self.dtype,
            use_fast_variance: self.use_fast_variance,
            mask: grouped_mask.as_ref(),
            group: self.group.as_deref().map(|g| g as &dyn DeviceGroup),
            ..StatsOptions::new()
        };
        let (mean, var) = compute_stats(&grouped, &grouped_reduction, opts)?;

        // Broadcast each group's statistic back across its member channels
        // and collapse to full channel resolution.
        let mut expanded = mean.dims().to_vec();
        expanded[rank] = self.group_size;
        let mut channel_shape = expanded[..rank - 1].to_vec();
        channel_shape.push(expanded[rank - 1] * expanded[rank]);
        let mean = mean
            .broadcast_as(expanded.clone())?
            .contiguous()?
            .reshape(channel_shape.clone())?;
        let var = var
            .broadcast_as(expanded)?
            .contiguous()?
            .reshape(channel_shape)?;

        let channel_reduction: Vec<isize> = reduction
            .iter()
            .filter(|&&a| a != rank - 1)
            .map(|&a| a as isize)
            .collect();
        normalize(
            x,
            &mean,
            &var,
            self.weight.as_ref(),
            self.bias.as_ref(),
            &channel_reduction,
            &[-1],
            self.dtype,
            self.epsilon,
        )
    }
}

impl Module for GroupNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with_mask(x, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn builder() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn group_spec_must_be_exclusive() {
        let (_vm, vb) = builder();
        assert!(GroupNorm::new(6, Some(2), Some(3), GroupNormConfig::default(), vb.clone()).is_err());
        assert!(GroupNorm::new(6, None, None, GroupNormConfig::default(), vb).is_err());
    }

    #[test]
    fn group_count_must_divide_channels() {
        let (_vm, vb) = builder();
        assert!(GroupNorm::new(6, Some(4), None, GroupNormConfig::default(), vb.clone()).is_err());
        assert!(GroupNorm::new(6, None, Some(5), GroupNormConfig::default(), vb).is_err());
    }

    #[test]
    fn group_size_derives_group_count() -> Result<()> {
        let (_vm, vb) = builder();
        let gn = GroupNorm::new(6, None, Some(3), GroupNormConfig::default(), vb)?;
        assert_eq!(gn.num_groups(), 2);
        assert_eq!(gn.group_size(), 3);
        Ok(())
    }
}
