//! Channel projections applied at every spatial position.
//!
//! `quant_conv` and `post_quant_conv` are 1x1 convolutions: a shared linear
//! map over the channel axis, broadcast over all pixels (or voxels).

use crate::perf::{self, Metric};
use crate::tensors::fixed_dims;
use anyhow::{ensure, Result};
use burn::tensor::{
    backend::Backend,
    module::{conv2d, conv3d},
    ops::ConvOptions,
    Tensor, TensorData,
};
use rand::Rng;

/// Spatial arrangement of latent tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialLayout {
    /// `[batch, channels, height, width]`.
    Planar,
    /// `[batch, channels, depth, height, width]`.
    Volumetric,
}

impl SpatialLayout {
    /// Pick the layout from the `use_voxel` switch.
    pub fn from_voxel(use_voxel: bool) -> Self {
        if use_voxel {
            SpatialLayout::Volumetric
        } else {
            SpatialLayout::Planar
        }
    }

    /// Tensor rank including batch and channel axes.
    pub fn rank(self) -> usize {
        match self {
            SpatialLayout::Planar => 4,
            SpatialLayout::Volumetric => 5,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            SpatialLayout::Planar => "planar (b c h w)",
            SpatialLayout::Volumetric => "volumetric (b c d h w)",
        }
    }
}

/// 1x1 convolution with weights stored as a `[out, in]` matrix.
#[derive(Debug, Clone)]
pub struct Projection<B: Backend> {
    /// Weight with shape `[out, in]`.
    pub weight: Tensor<B, 2>,
    /// Bias with shape `[out]`.
    pub bias: Tensor<B, 1>,
    /// Layout the projection operates on.
    pub layout: SpatialLayout,
}

impl<B: Backend> Projection<B> {
    /// Create a projection from existing parameters.
    pub fn new(weight: Tensor<B, 2>, bias: Tensor<B, 1>, layout: SpatialLayout) -> Result<Self> {
        let [out_channels, _] = weight.dims();
        let [bias_len] = bias.dims();
        ensure!(
            bias_len == out_channels,
            "projection bias has {bias_len} entries, expected {out_channels}"
        );
        Ok(Self {
            weight,
            bias,
            layout,
        })
    }

    /// Initialize like a freshly constructed 1x1 convolution.
    ///
    /// Weight and bias are uniform in `[-1/sqrt(in), 1/sqrt(in)]`.
    pub fn init<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        layout: SpatialLayout,
        rng: &mut R,
        device: &B::Device,
    ) -> Self {
        let bound = 1.0 / (in_channels as f32).sqrt();
        let weight: Vec<f32> = (0..out_channels * in_channels)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        let bias: Vec<f32> = (0..out_channels)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        Self {
            weight: Tensor::from_data(TensorData::new(weight, [out_channels, in_channels]), device),
            bias: Tensor::from_data(TensorData::new(bias, [out_channels]), device),
            layout,
        }
    }

    /// Number of input channels.
    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Apply the projection to a channel-first tensor of the configured layout.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let dims = input.dims();
        ensure!(
            D == self.layout.rank(),
            "{} projection expects rank {}, got shape {dims:?}",
            self.layout.name(),
            self.layout.rank()
        );
        let (in_channels, out_channels) = (self.in_channels(), self.out_channels());
        ensure!(
            dims[1] == in_channels,
            "projection expects {in_channels} channels, got shape {dims:?}"
        );

        let mut out_dims = dims;
        out_dims[1] = out_channels;
        let bias = Some(self.bias.clone());

        let output = match self.layout {
            SpatialLayout::Planar => {
                let x: Tensor<B, 4> = input.reshape(fixed_dims::<4>(&dims)?);
                let weight = self
                    .weight
                    .clone()
                    .reshape([out_channels, in_channels, 1, 1]);
                conv2d(x, weight, bias, ConvOptions::new([1, 1], [0, 0], [1, 1], 1))
                    .reshape(out_dims)
            }
            SpatialLayout::Volumetric => {
                let x: Tensor<B, 5> = input.reshape(fixed_dims::<5>(&dims)?);
                let weight = self
                    .weight
                    .clone()
                    .reshape([out_channels, in_channels, 1, 1, 1]);
                conv3d(
                    x,
                    weight,
                    bias,
                    ConvOptions::new([1, 1, 1], [0, 0, 0], [1, 1, 1], 1),
                )
                .reshape(out_dims)
            }
        };
        Ok(output)
    }
}

/// Forward helper that records the projection under `metric`.
pub(crate) fn project<B: Backend, const D: usize>(
    projection: &Projection<B>,
    input: Tensor<B, D>,
    metric: Metric,
) -> Result<Tensor<B, D>> {
    let _span = perf::span(metric);
    projection.forward(input)
}
