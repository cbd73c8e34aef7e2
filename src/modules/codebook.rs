//! Learned codebook and nearest-neighbor matching.
//!
//! Distances use the expansion `|z - e|^2 = |z|^2 + |e|^2 - 2 z.e`: one dense
//! matmul plus two norm terms, never a `[N, n_e, e_dim]` difference tensor.
//! The argmin runs on the host so ties resolve identically on every backend.

use crate::perf::{self, Metric};
use crate::tensors::{empty_rows, float_values, int_tensor};
use anyhow::{bail, ensure, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::Rng;

/// Embedding table with shape `[n_e, e_dim]`.
#[derive(Debug, Clone)]
pub struct Codebook<B: Backend> {
    /// Codebook vectors, one per row.
    pub weight: Tensor<B, 2>,
}

/// Result of matching inputs against the codebook.
#[derive(Debug, Clone)]
pub struct CodebookMatch<B: Backend> {
    /// Winning codebook index per input row.
    pub indices: Vec<i64>,
    /// Codebook vectors for each winning index, `[N, e_dim]`.
    pub vectors: Tensor<B, 2>,
}

impl<B: Backend> Codebook<B> {
    /// Wrap an existing `[n_e, e_dim]` weight.
    pub fn new(weight: Tensor<B, 2>) -> Result<Self> {
        let [n_e, e_dim] = weight.dims();
        ensure!(n_e >= 1, "codebook needs at least one entry");
        ensure!(e_dim >= 1, "codebook vectors need at least one dimension");
        Ok(Self { weight })
    }

    /// Initialize uniformly in `[-1/n_e, 1/n_e]`.
    pub fn init<R: Rng + ?Sized>(
        n_e: usize,
        e_dim: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        ensure!(n_e >= 1, "codebook needs at least one entry");
        let bound = 1.0 / n_e as f32;
        let values: Vec<f32> = (0..n_e * e_dim)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        Self::new(Tensor::from_data(TensorData::new(values, [n_e, e_dim]), device))
    }

    /// Number of codebook entries.
    pub fn num_embeddings(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Dimensionality of each entry.
    pub fn embedding_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Squared distances `[N, n_e]` from each row of `z_flat` to every entry.
    ///
    /// Both operands are detached; the selection is not differentiable.
    pub fn distances(&self, z_flat: Tensor<B, 2>) -> Tensor<B, 2> {
        let n_e = self.num_embeddings();
        let z = z_flat.detach();
        let embed = self.weight.clone().detach();

        let z_sq = z.clone().powf_scalar(2.0).sum_dim(1);
        let e_sq = embed.clone().powf_scalar(2.0).sum_dim(1).reshape([1, n_e]);
        let cross = z.matmul(embed.transpose());
        z_sq + e_sq - cross.mul_scalar(2.0)
    }

    /// Index of the closest entry for each row of `z_flat`.
    pub fn nearest_indices(&self, z_flat: Tensor<B, 2>) -> Vec<i64> {
        let _span = perf::span(Metric::NearestNeighbor);
        let [rows, _] = z_flat.dims();
        if rows == 0 {
            return Vec::new();
        }
        let n_e = self.num_embeddings();
        let distances = float_values(self.distances(z_flat));
        first_argmin_rows(&distances, n_e)
    }

    /// Match each row of `z_flat` and look up the winning vectors.
    pub fn nearest(&self, z_flat: Tensor<B, 2>) -> CodebookMatch<B> {
        let device = z_flat.device();
        let indices = self.nearest_indices(z_flat);
        let vectors = self.select_rows(&indices, &device);
        CodebookMatch { indices, vectors }
    }

    /// Look up codebook vectors `[N, e_dim]` by index.
    ///
    /// # Errors
    ///
    /// Returns an error if any index is outside `[0, n_e)`.
    pub fn lookup(&self, indices: &[i64], device: &B::Device) -> Result<Tensor<B, 2>> {
        let n_e = self.num_embeddings();
        if let Some(bad) = indices.iter().find(|&&idx| idx < 0 || idx as usize >= n_e) {
            bail!("index {bad} out of bounds for codebook of size {n_e}");
        }
        Ok(self.select_rows(indices, device))
    }

    /// Gather rows without bounds checks; callers guarantee valid indices.
    fn select_rows(&self, indices: &[i64], device: &B::Device) -> Tensor<B, 2> {
        let _span = perf::span(Metric::CodebookLookup);
        if indices.is_empty() {
            return empty_rows(0, self.embedding_dim(), device);
        }
        let ids = int_tensor::<B, 1>(indices.to_vec(), [indices.len()], device);
        self.weight.clone().select(0, ids)
    }
}

/// Row-wise argmin over a row-major `[rows, cols]` buffer.
///
/// Ties resolve to the lowest column. NaN never beats a comparable value;
/// PyTorch's `argmin` returns the first NaN instead, so rows holding NaN can
/// pick a different code than a checkpoint's source framework would.
pub fn first_argmin_rows(values: &[f32], cols: usize) -> Vec<i64> {
    if cols == 0 {
        return Vec::new();
    }
    values
        .chunks_exact(cols)
        .map(|row| {
            let mut best = 0usize;
            for (col, &value) in row.iter().enumerate().skip(1) {
                let current = row[best];
                if value < current || (current.is_nan() && !value.is_nan()) {
                    best = col;
                }
            }
            best as i64
        })
        .collect()
}
