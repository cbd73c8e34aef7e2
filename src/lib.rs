//! # vqbook - vector-quantization bottleneck for autoencoder latents
//!
//! Maps continuous latent tensors to the nearest entry of a learned, finite
//! codebook. The discretized latents (and their indices) are what a downstream
//! prior, such as a transformer over codes, consumes.
//!
//! ## Architecture Overview
//!
//! 1. **Projections** ([`modules::projection`]): 1x1 convolutions mapping
//!    `z_channels` to the codebook dimension and back, in 2-D or 3-D (voxel)
//!    layout.
//! 2. **Codebook** ([`modules::codebook`]): the `[n_e, e_dim]` table and the
//!    nearest-neighbor matcher.
//! 3. **Remap** ([`remap`]): optional compaction of indices to the subset of
//!    codebook entries that are actually used.
//! 4. **Quantizer** ([`VectorQuantizer`]): wires the pieces together, computes
//!    the codebook/commitment loss and applies the straight-through estimator.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn::tensor::Tensor;
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use vqbook::{load_config, VectorQuantizer};
//!
//! let config = load_config("vq.yaml").unwrap();
//! let device = NdArrayDevice::default();
//! let quantizer = VectorQuantizer::<NdArray<f32>>::from_config(&config, &device).unwrap();
//!
//! // Voxel layout: [batch, z_channels, depth, height, width]
//! let z = Tensor::<NdArray<f32>, 5>::zeros([1, config.z_channels, 4, 4, 4], &device);
//! let out = quantizer.forward(z).unwrap();
//! println!("indices shape: {:?}", out.info.indices.shape());
//! ```

// Public modules - these are part of the stable API
pub mod config;
pub mod model;
pub mod modules;
pub mod remap;

// Support modules - exposed for the CLI and integration tests.
#[doc(hidden)]
pub mod perf;
#[doc(hidden)]
pub mod tensors;
#[doc(hidden)]
pub mod weights;

// Re-exports forming the public API
pub use config::{load_config, QuantizerConfig, UnknownIndex, UnknownIndexName};
pub use model::quantizer::{
    CodeIndices, EncodingInfo, ForwardOptions, QuantizerOutput, VectorQuantizer,
};
pub use modules::projection::SpatialLayout;
pub use remap::{RemapTable, UnknownIndexPolicy};
