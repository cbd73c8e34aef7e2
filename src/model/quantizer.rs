//! Vector-quantization bottleneck.
//!
//! The quantizer projects encoder output into codebook space, snaps every
//! spatial position to its nearest codebook vector and projects back. A
//! straight-through estimator keeps the discrete step gradient-transparent.
//!
//! Tensor ranks are checked at runtime against the configured
//! [`SpatialLayout`]: rank 4 for planar latents, rank 5 for volumetric ones.

use crate::config::QuantizerConfig;
use crate::modules::codebook::{Codebook, CodebookMatch};
use crate::modules::projection::{project, Projection, SpatialLayout};
use crate::perf::{self, Metric};
use crate::remap::RemapTable;
use crate::tensors::{channels_first_axes, channels_last_axes, int_tensor, int_values};
use crate::weights::{
    load_quantizer_state_dict, WeightTensor, EMBEDDING_WEIGHT,
    POST_QUANT_CONV_BIAS, POST_QUANT_CONV_WEIGHT, QUANT_CONV_BIAS, QUANT_CONV_WEIGHT,
    USED_BUFFER,
};
use anyhow::{anyhow, bail, ensure, Result};
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// Options kept only for interface parity with Gumbel-softmax quantizers.
///
/// Every field must stay at its default; anything else is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForwardOptions {
    /// Sampling temperature; only `None` or `1.0` are accepted.
    pub temp: Option<f32>,
    /// Must be `false`.
    pub rescale_logits: bool,
    /// Must be `false`.
    pub return_logits: bool,
}

impl ForwardOptions {
    fn check(&self) -> Result<()> {
        const MSG: &str = "Only for interface compatible with Gumbel";
        ensure!(self.temp.map_or(true, |temp| temp == 1.0), MSG);
        ensure!(!self.rescale_logits, MSG);
        ensure!(!self.return_logits, MSG);
        Ok(())
    }
}

/// Codebook indices with their logical shape.
#[derive(Debug, Clone)]
pub struct CodeIndices<B: Backend> {
    values: Tensor<B, 1, Int>,
    shape: Vec<usize>,
}

impl<B: Backend> CodeIndices<B> {
    fn new(values: Vec<i64>, shape: Vec<usize>, device: &B::Device) -> Self {
        let len = values.len();
        Self {
            values: int_tensor(values, [len], device),
            shape,
        }
    }

    /// Logical shape of the indices.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat index tensor.
    pub fn flat(&self) -> Tensor<B, 1, Int> {
        self.values.clone()
    }

    /// Copy the indices to the host.
    pub fn to_vec(&self) -> Vec<i64> {
        int_values(self.values.clone())
    }

    /// Reshape into a tensor whose rank matches [`CodeIndices::shape`].
    pub fn into_tensor<const D: usize>(self) -> Result<Tensor<B, D, Int>> {
        let shape: [usize; D] = self
            .shape
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("indices have shape {:?}, not rank {D}", self.shape))?;
        Ok(self.values.reshape(shape))
    }
}

/// Auxiliary outputs shared with sibling quantizers.
#[derive(Debug, Clone)]
pub struct EncodingInfo<B: Backend> {
    /// Always `None` for this quantizer.
    pub perplexity: Option<Tensor<B, 1>>,
    /// Always `None` for this quantizer.
    pub min_encodings: Option<Tensor<B, 2>>,
    /// Selected codebook indices (compact space when remapping).
    pub indices: CodeIndices<B>,
}

/// Result of a quantizer forward pass.
#[derive(Debug, Clone)]
pub struct QuantizerOutput<B: Backend, const D: usize> {
    /// Quantized latents, same shape as the input.
    pub quantized: Tensor<B, D>,
    /// Scalar codebook + commitment loss, shape `[1]`.
    pub loss: Tensor<B, 1>,
    /// Indices and interface-parity fields.
    pub info: EncodingInfo<B>,
}

/// Codebook and commitment loss between quantized and encoder vectors.
///
/// Historically `beta` scaled the codebook term instead of the commitment term.
/// `legacy = true` keeps that placement so previously trained models see the
/// same objective; `legacy = false` scales the commitment term.
pub fn quantization_loss<B: Backend, const D: usize>(
    z_q: Tensor<B, D>,
    z: Tensor<B, D>,
    beta: f32,
    legacy: bool,
) -> Tensor<B, 1> {
    // Gradient reaches the encoder only.
    let commitment = (z_q.clone().detach() - z.clone()).powf_scalar(2.0).mean();
    // Gradient reaches the codebook only.
    let codebook = (z_q - z.detach()).powf_scalar(2.0).mean();
    if legacy {
        commitment + codebook.mul_scalar(beta)
    } else {
        commitment.mul_scalar(beta) + codebook
    }
}

/// Forward value of `z_q`, gradient of the identity on `z`.
pub fn straight_through<B: Backend, const D: usize>(
    z: Tensor<B, D>,
    z_q: Tensor<B, D>,
) -> Tensor<B, D> {
    z.clone() + (z_q - z).detach()
}

/// VQ bottleneck with projections, codebook and optional index remapping.
#[derive(Debug)]
pub struct VectorQuantizer<B: Backend> {
    /// Learned codebook `[n_e, e_dim]`.
    pub codebook: Codebook<B>,
    /// `z_channels -> e_dim` projection.
    pub quant_conv: Projection<B>,
    /// `e_dim -> z_channels` projection.
    pub post_quant_conv: Projection<B>,
    /// Commitment-loss weight.
    pub beta: f32,
    /// Historical beta placement switch.
    pub legacy: bool,
    /// Emit indices as `[batch, *spatial]`.
    pub sane_index_shape: bool,
    remap: Option<RemapTable>,
    layout: SpatialLayout,
}

impl<B: Backend> VectorQuantizer<B> {
    /// Assemble a quantizer from already-built parts.
    pub fn new(
        codebook: Codebook<B>,
        quant_conv: Projection<B>,
        post_quant_conv: Projection<B>,
        remap: Option<RemapTable>,
        beta: f32,
        legacy: bool,
        sane_index_shape: bool,
    ) -> Result<Self> {
        let e_dim = codebook.embedding_dim();
        let layout = quant_conv.layout;
        ensure!(
            post_quant_conv.layout == layout,
            "quant_conv and post_quant_conv use different layouts"
        );
        ensure!(
            quant_conv.out_channels() == e_dim && post_quant_conv.in_channels() == e_dim,
            "projections must map to and from e_dim = {e_dim}"
        );
        ensure!(
            post_quant_conv.out_channels() == quant_conv.in_channels(),
            "post_quant_conv must restore {} channels",
            quant_conv.in_channels()
        );
        Ok(Self {
            codebook,
            quant_conv,
            post_quant_conv,
            beta,
            legacy,
            sane_index_shape,
            remap,
            layout,
        })
    }

    /// Build a freshly initialized quantizer from configuration.
    ///
    /// Loads the remap table and, when configured, checkpoint weights.
    pub fn from_config(config: &QuantizerConfig, device: &B::Device) -> Result<Self> {
        let _span = perf::span(Metric::QuantizerFromConfig);
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let layout = SpatialLayout::from_voxel(config.use_voxel);
        let codebook = Codebook::init(config.n_e, config.e_dim, &mut rng, device)?;
        let quant_conv = Projection::init(config.z_channels, config.e_dim, layout, &mut rng, device);
        let post_quant_conv =
            Projection::init(config.e_dim, config.z_channels, layout, &mut rng, device);

        let remap = match config.remap.as_deref() {
            Some(path) => {
                let table = RemapTable::from_path(path, config.unknown_index, config.seed)?;
                tracing::info!(
                    "Remapping {} indices to {} indices. Using {:?} for unknown indices.",
                    config.n_e,
                    table.re_embed(),
                    table.policy()
                );
                Some(table)
            }
            None => None,
        };

        let mut quantizer = Self::new(
            codebook,
            quant_conv,
            post_quant_conv,
            remap,
            config.beta,
            config.legacy,
            config.sane_index_shape,
        )?;

        if let Some(weights_path) = config.weights_path.as_deref() {
            let state = load_quantizer_state_dict(weights_path)?;
            quantizer.load_state_dict(&state, device)?;
            tracing::debug!(path = weights_path, "loaded quantizer weights");
        }
        Ok(quantizer)
    }

    /// Install parameters from a mapped checkpoint.
    ///
    /// Projection kernels may be stored in conv layout (`[out, in, 1, 1]` or
    /// `[out, in, 1, 1, 1]`); the kernel rank must match the layout.
    pub fn load_state_dict(
        &mut self,
        state: &HashMap<String, WeightTensor>,
        device: &B::Device,
    ) -> Result<()> {
        let fetch = |name: &str| {
            state
                .get(name)
                .ok_or_else(|| anyhow!("checkpoint is missing `{name}`"))
        };
        let (n_e, e_dim) = (self.n_e(), self.e_dim());
        let z_channels = self.quant_conv.in_channels();
        let rank = self.layout.rank();

        for name in [QUANT_CONV_WEIGHT, POST_QUANT_CONV_WEIGHT] {
            let kernel_rank = fetch(name)?.shape.len();
            ensure!(
                kernel_rank == rank,
                "`{name}` has rank {kernel_rank}, {} layout needs {rank}",
                self.layout.name()
            );
        }

        let embedding = fetch(EMBEDDING_WEIGHT)?.to_tensor([n_e, e_dim], device)?;
        let quant_weight = fetch(QUANT_CONV_WEIGHT)?.to_tensor([e_dim, z_channels], device)?;
        let quant_bias = fetch(QUANT_CONV_BIAS)?.to_tensor([e_dim], device)?;
        let post_weight = fetch(POST_QUANT_CONV_WEIGHT)?.to_tensor([z_channels, e_dim], device)?;
        let post_bias = fetch(POST_QUANT_CONV_BIAS)?.to_tensor([z_channels], device)?;

        if let Some(used) = state.get(USED_BUFFER) {
            let used = used.to_i64_vec()?;
            match &self.remap {
                Some(table) if table.used() != used.as_slice() => {
                    bail!("checkpoint `used` buffer differs from the configured remap table")
                }
                Some(_) => {}
                None => tracing::warn!("checkpoint has a `used` buffer but no remap is configured"),
            }
        }

        self.codebook = Codebook::new(embedding)?;
        self.quant_conv = Projection::new(quant_weight, quant_bias, self.layout)?;
        self.post_quant_conv = Projection::new(post_weight, post_bias, self.layout)?;
        Ok(())
    }

    /// Mark every parameter as requiring gradients (no-op off autodiff backends).
    pub fn require_grad(mut self) -> Self {
        self.codebook.weight = self.codebook.weight.require_grad();
        self.quant_conv.weight = self.quant_conv.weight.require_grad();
        self.quant_conv.bias = self.quant_conv.bias.require_grad();
        self.post_quant_conv.weight = self.post_quant_conv.weight.require_grad();
        self.post_quant_conv.bias = self.post_quant_conv.bias.require_grad();
        self
    }

    /// Codebook size.
    pub fn n_e(&self) -> usize {
        self.codebook.num_embeddings()
    }

    /// Codebook vector dimensionality.
    pub fn e_dim(&self) -> usize {
        self.codebook.embedding_dim()
    }

    /// Size of the emitted index space.
    pub fn re_embed(&self) -> usize {
        self.remap
            .as_ref()
            .map_or_else(|| self.n_e(), RemapTable::re_embed)
    }

    /// Spatial layout selected at construction.
    pub fn layout(&self) -> SpatialLayout {
        self.layout
    }

    /// Remap table, if configured.
    pub fn remap_table(&self) -> Option<&RemapTable> {
        self.remap.as_ref()
    }

    /// Quantize encoder output `[batch, z_channels, *spatial]`.
    pub fn forward<const D: usize>(&self, z: Tensor<B, D>) -> Result<QuantizerOutput<B, D>> {
        self.forward_with(z, ForwardOptions::default())
    }

    /// [`VectorQuantizer::forward`] with the Gumbel-parity options spelled out.
    pub fn forward_with<const D: usize>(
        &self,
        z: Tensor<B, D>,
        options: ForwardOptions,
    ) -> Result<QuantizerOutput<B, D>> {
        let _span = perf::span(Metric::QuantizerForward);
        options.check()?;
        let z = project(&self.quant_conv, z, Metric::QuantConv)?;
        let output = self.quantize(z)?;
        let quantized = project(&self.post_quant_conv, output.quantized, Metric::PostQuantConv)?;
        Ok(QuantizerOutput {
            quantized,
            loss: output.loss,
            info: output.info,
        })
    }

    /// Quantize latents that are already in codebook space `[batch, e_dim, *spatial]`.
    pub fn forward_quantizer<const D: usize>(
        &self,
        z: Tensor<B, D>,
    ) -> Result<QuantizerOutput<B, D>> {
        self.forward_quantizer_with(z, ForwardOptions::default())
    }

    /// [`VectorQuantizer::forward_quantizer`] with explicit Gumbel-parity options.
    pub fn forward_quantizer_with<const D: usize>(
        &self,
        z: Tensor<B, D>,
        options: ForwardOptions,
    ) -> Result<QuantizerOutput<B, D>> {
        options.check()?;
        self.quantize(z)
    }

    fn quantize<const D: usize>(&self, z: Tensor<B, D>) -> Result<QuantizerOutput<B, D>> {
        let device = z.device();
        let z = self.channels_last(z)?;
        let cl_dims = z.dims();
        let batch = cl_dims[0];
        let positions: usize = cl_dims[..D - 1].iter().product();
        let e_dim = self.e_dim();

        let CodebookMatch { indices, vectors } =
            self.codebook.nearest(z.clone().reshape([positions, e_dim]));
        let z_q = vectors.reshape(cl_dims);

        let loss = quantization_loss(z_q.clone(), z.clone(), self.beta, self.legacy);
        let quantized = straight_through(z, z_q).permute(channels_first_axes::<D>());
        perf::add_count(Metric::PositionsQuantized, positions as u64);

        let mut indices = indices;
        let mut shape = vec![positions];
        if let Some(remap) = &self.remap {
            let per_item = positions.checked_div(batch).unwrap_or(0);
            indices = remap.remap_to_used(&indices, &[batch, per_item])?;
            shape = vec![positions, 1];
        }
        if self.sane_index_shape {
            shape = cl_dims[..D - 1].to_vec();
        }

        Ok(QuantizerOutput {
            quantized,
            loss,
            info: EncodingInfo {
                perplexity: None,
                min_encodings: None,
                indices: CodeIndices::new(indices, shape, &device),
            },
        })
    }

    /// Check rank and channels, then move channels last: `b c ... -> b ... c`.
    fn channels_last<const D: usize>(&self, z: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let dims = z.dims();
        ensure!(
            D == self.layout.rank(),
            "{} quantizer expects rank {}, got shape {dims:?}",
            self.layout.name(),
            self.layout.rank()
        );
        ensure!(
            dims[1] == self.e_dim(),
            "expected {} channels in codebook space, got shape {dims:?}",
            self.e_dim()
        );
        Ok(z.permute(channels_last_axes::<D>()))
    }

    /// Full-space codebook indices for encoder output, shaped `[batch, *spatial]`.
    ///
    /// Inference only: no loss, no straight-through, no remapping.
    pub fn get_codebook_index<const D: usize>(&self, z: Tensor<B, D>) -> Result<CodeIndices<B>> {
        let _span = perf::span(Metric::CodebookIndex);
        let device = z.device();
        let z = project(&self.quant_conv, z, Metric::QuantConv)?;
        let z = self.channels_last(z)?;
        let cl_dims = z.dims();
        let positions: usize = cl_dims[..D - 1].iter().product();
        let indices = self
            .codebook
            .nearest_indices(z.reshape([positions, self.e_dim()]));
        Ok(CodeIndices::new(indices, cl_dims[..D - 1].to_vec(), &device))
    }

    /// Look up codebook vectors and return them channel-first.
    ///
    /// `shape` is channels-last, `[batch, *spatial, e_dim]`. Indices are in
    /// compact space when a remap table is configured.
    ///
    /// # Errors
    ///
    /// Fails when the index count does not match `shape` or an index is out of
    /// bounds.
    pub fn get_codebook_entry<const D: usize>(
        &self,
        indices: Tensor<B, 1, Int>,
        shape: [usize; D],
    ) -> Result<Tensor<B, D>> {
        ensure!(D >= 2, "codebook entry shape needs batch and channel axes");
        ensure!(
            shape[D - 1] == self.e_dim(),
            "last axis of {shape:?} must equal e_dim = {}",
            self.e_dim()
        );
        let device = indices.device();
        let positions: usize = shape[..D - 1].iter().product();
        let values = int_values(indices);
        ensure!(
            values.len() == positions,
            "{} indices cannot fill shape {shape:?}",
            values.len()
        );
        let per_item = positions.checked_div(shape[0]).unwrap_or(0);
        let values = self.unmap_values(values, [shape[0], per_item])?;

        let z_q = self.codebook.lookup(&values, &device)?;
        Ok(z_q.reshape(shape).permute(channels_first_axes::<D>()))
    }

    /// Look up codebook vectors as `[N, e_dim]` rows, without reshaping.
    pub fn codebook_vectors(&self, indices: Tensor<B, 1, Int>) -> Result<Tensor<B, 2>> {
        let device = indices.device();
        let values = int_values(indices);
        let len = values.len();
        let values = self.unmap_values(values, [1, len])?;
        self.codebook.lookup(&values, &device)
    }

    /// Decode indices straight to the encoder channel space.
    ///
    /// Equivalent to [`VectorQuantizer::get_codebook_entry`] followed by
    /// `post_quant_conv`.
    pub fn decode_indices<const D: usize>(
        &self,
        indices: Tensor<B, 1, Int>,
        shape: [usize; D],
    ) -> Result<Tensor<B, D>> {
        let z_q = self.get_codebook_entry(indices, shape)?;
        project(&self.post_quant_conv, z_q, Metric::PostQuantConv)
    }

    /// Compact full-space indices `[batch, ...]` through the remap table.
    pub fn remap_to_used<const D: usize>(
        &self,
        inds: Tensor<B, D, Int>,
    ) -> Result<Tensor<B, D, Int>> {
        let table = self.require_remap()?;
        let (dims, device) = (inds.dims(), inds.device());
        let values = table.remap_to_used(&int_values(inds), &dims)?;
        Ok(int_tensor(values, dims, &device))
    }

    /// Expand compact indices `[batch, ...]` back to full codebook indices.
    pub fn unmap_to_all<const D: usize>(
        &self,
        inds: Tensor<B, D, Int>,
    ) -> Result<Tensor<B, D, Int>> {
        let table = self.require_remap()?;
        let (dims, device) = (inds.dims(), inds.device());
        let values = table.unmap_to_all(&int_values(inds), &dims)?;
        Ok(int_tensor(values, dims, &device))
    }

    fn require_remap(&self) -> Result<&RemapTable> {
        self.remap
            .as_ref()
            .ok_or_else(|| anyhow!("no remap table configured"))
    }

    fn unmap_values(&self, values: Vec<i64>, shape: [usize; 2]) -> Result<Vec<i64>> {
        match &self.remap {
            Some(table) => table.unmap_to_all(&values, &shape),
            None => Ok(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UnknownIndex, UnknownIndexName};
    use burn::tensor::{TensorData, Tolerance};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type B = NdArray<f32>;

    /// Identity projections around a 2-D codebook, planar layout.
    fn identity_quantizer(
        codebook: Vec<f32>,
        n_e: usize,
        remap: Option<RemapTable>,
    ) -> VectorQuantizer<B> {
        let device = NdArrayDevice::default();
        let eye = |n: usize| {
            let mut values = vec![0.0f32; n * n];
            for i in 0..n {
                values[i * n + i] = 1.0;
            }
            Tensor::<B, 2>::from_data(TensorData::new(values, [n, n]), &device)
        };
        let zeros = Tensor::<B, 1>::zeros([2], &device);
        let book = Codebook::new(Tensor::from_data(TensorData::new(codebook, [n_e, 2]), &device))
            .expect("codebook");
        VectorQuantizer::new(
            book,
            Projection::new(eye(2), zeros.clone(), SpatialLayout::Planar).expect("proj"),
            Projection::new(eye(2), zeros, SpatialLayout::Planar).expect("proj"),
            remap,
            0.25,
            true,
            false,
        )
        .expect("quantizer")
    }

    fn latents(values: Vec<f32>, shape: [usize; 4]) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(values, shape), &NdArrayDevice::default())
    }

    #[test]
    fn gumbel_options_must_stay_default() {
        let q = identity_quantizer(vec![0.0, 0.0, 1.0, 1.0], 2, None);
        let z = latents(vec![0.1, 0.9], [1, 2, 1, 1]);
        for options in [
            ForwardOptions { temp: Some(0.5), ..Default::default() },
            ForwardOptions { rescale_logits: true, ..Default::default() },
            ForwardOptions { return_logits: true, ..Default::default() },
        ] {
            let err = q.forward_with(z.clone(), options).unwrap_err();
            assert!(err.to_string().contains("Gumbel"));
        }
        let ok = ForwardOptions { temp: Some(1.0), ..Default::default() };
        assert!(q.forward_with(z, ok).is_ok());
    }

    #[test]
    fn forward_snaps_each_pixel_to_nearest_entry() {
        let q = identity_quantizer(vec![0.0, 0.0, 1.0, 1.0], 2, None);
        // pixel 0 = (0.1, 0.2), pixel 1 = (0.9, 0.8)
        let z = latents(vec![0.1, 0.9, 0.2, 0.8], [1, 2, 1, 2]);
        let out = q.forward(z).expect("forward");
        assert_eq!(out.info.indices.to_vec(), vec![0, 1]);
        assert_eq!(out.info.indices.shape(), &[2]);
        assert!(out.info.perplexity.is_none());
        assert!(out.info.min_encodings.is_none());
        let expected = TensorData::new(vec![0.0f32, 1.0, 0.0, 1.0], [1, 2, 1, 2]);
        out.quantized
            .to_data()
            .assert_approx_eq(&expected, Tolerance::<f32>::absolute(1e-6));
    }

    #[test]
    fn loss_combines_both_terms() {
        let q = identity_quantizer(vec![0.0, 0.0], 1, None);
        let z = latents(vec![1.0, 1.0], [1, 2, 1, 1]);
        let out = q.forward_quantizer(z).expect("forward");
        // mse = 1.0 for both terms, loss = 1 + 0.25 * 1
        let loss = out.loss.into_data().iter::<f32>().next().expect("scalar");
        assert!((loss - 1.25).abs() < 1e-6);
    }

    #[test]
    fn wrong_rank_or_channels_error() {
        let q = identity_quantizer(vec![0.0, 0.0], 1, None);
        let device = NdArrayDevice::default();
        assert!(q.forward(Tensor::<B, 5>::zeros([1, 2, 1, 1, 1], &device)).is_err());
        assert!(q.forward(Tensor::<B, 4>::zeros([1, 3, 1, 1], &device)).is_err());
        assert!(q.forward_quantizer(Tensor::<B, 3>::zeros([1, 2, 1], &device)).is_err());
    }

    #[test]
    fn remapped_indices_use_compact_space() {
        let table = RemapTable::new(
            vec![2, 0],
            UnknownIndex::Named(UnknownIndexName::Extra),
            None,
        )
        .expect("table");
        let q = identity_quantizer(vec![0.0, 0.0, 5.0, 5.0, 1.0, 1.0], 3, Some(table));
        assert_eq!(q.re_embed(), 3);
        // pixels near entries 2, 0 and 1 (1 is not in the table)
        let z = latents(vec![0.9, 0.1, 5.1, 1.1, 0.0, 4.9], [1, 2, 1, 3]);
        let out = q.forward(z).expect("forward");
        assert_eq!(out.info.indices.to_vec(), vec![0, 1, 2]);
        assert_eq!(out.info.indices.shape(), &[3, 1]);
    }

    #[test]
    fn codebook_entry_unmaps_compact_indices() {
        let table = RemapTable::new(
            vec![2, 0],
            UnknownIndex::Named(UnknownIndexName::Extra),
            None,
        )
        .expect("table");
        let q = identity_quantizer(vec![0.0, 0.0, 5.0, 5.0, 1.0, 1.0], 3, Some(table));
        let device = NdArrayDevice::default();
        let indices = int_tensor::<B, 1>(vec![0, 1, 2], [3], &device);
        let entry = q.get_codebook_entry(indices, [1, 1, 3, 2]).expect("entry");
        assert_eq!(entry.dims(), [1, 2, 1, 3]);
        // compact 0 -> full 2, compact 1 -> full 0, extra slot -> full 0
        let expected = TensorData::new(vec![1.0f32, 0.0, 0.0, 1.0, 0.0, 0.0], [1, 2, 1, 3]);
        entry
            .to_data()
            .assert_approx_eq(&expected, Tolerance::<f32>::absolute(1e-6));
    }

    #[test]
    fn codebook_entry_checks_shape_and_bounds() {
        let q = identity_quantizer(vec![0.0, 0.0, 1.0, 1.0], 2, None);
        let device = NdArrayDevice::default();
        let ids = |v: Vec<i64>| {
            let len = v.len();
            int_tensor::<B, 1>(v, [len], &device)
        };
        assert!(q.get_codebook_entry(ids(vec![0, 1]), [1, 1, 3, 2]).is_err());
        assert!(q.get_codebook_entry(ids(vec![0, 1]), [1, 1, 2, 3]).is_err());
        assert!(q.get_codebook_entry(ids(vec![0, 2]), [1, 1, 2, 2]).is_err());
        let rows = q.codebook_vectors(ids(vec![1, 0])).expect("rows");
        assert_eq!(rows.dims(), [2, 2]);
    }

    #[test]
    fn tensor_remap_requires_table_and_batch_axis() {
        let q = identity_quantizer(vec![0.0, 0.0], 1, None);
        let device = NdArrayDevice::default();
        let inds = int_tensor::<B, 2>(vec![0, 0], [1, 2], &device);
        assert!(q.remap_to_used(inds).is_err());

        let table =
            RemapTable::new(vec![0], UnknownIndex::Fixed(0), None).expect("table");
        let q = identity_quantizer(vec![0.0, 0.0], 1, Some(table));
        let flat = int_tensor::<B, 1>(vec![0, 0], [2], &device);
        assert!(q.remap_to_used(flat.clone()).is_err());
        assert!(q.unmap_to_all(flat).is_err());
        let batched = int_tensor::<B, 2>(vec![0, 3], [1, 2], &device);
        let compact = q.remap_to_used(batched).expect("remap");
        assert_eq!(compact.dims(), [1, 2]);
        assert_eq!(int_values(compact), vec![0, 0]);
    }

    #[test]
    fn into_tensor_checks_rank() {
        let q = identity_quantizer(vec![0.0, 0.0, 1.0, 1.0], 2, None);
        let z = latents(vec![0.0; 8], [1, 2, 2, 2]);
        let indices = q.get_codebook_index(z).expect("index");
        assert_eq!(indices.shape(), &[1, 2, 2]);
        assert!(indices.clone().into_tensor::<2>().is_err());
        assert_eq!(indices.into_tensor::<3>().expect("rank 3").dims(), [1, 2, 2]);
    }
}
