//! Shared test utilities for quantizer construction and tensor comparisons.
#![allow(dead_code)]

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use std::path::Path;
use vqbook::modules::codebook::Codebook;
use vqbook::modules::projection::{Projection, SpatialLayout};
use vqbook::{RemapTable, VectorQuantizer};

pub type TestBackend = NdArray<f32>;
pub type GradBackend = Autodiff<NdArray<f32>>;

/// Assert two tensor data slices are element-wise close within tolerance.
pub fn assert_close(a: &TensorData, b: &TensorData, tol: f32) {
    let a_vals: Vec<f32> = a.iter::<f32>().collect();
    let b_vals: Vec<f32> = b.iter::<f32>().collect();
    assert_eq!(
        a_vals.len(),
        b_vals.len(),
        "tensor length mismatch: {} vs {}",
        a_vals.len(),
        b_vals.len()
    );
    for (idx, (x, y)) in a_vals.iter().zip(b_vals.iter()).enumerate() {
        if (x - y).abs() > tol {
            panic!(
                "mismatch at {idx}: {x} vs {y} (diff: {}, tol: {tol})",
                (x - y).abs()
            );
        }
    }
}

/// First element of a tensor as `f32`.
pub fn scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    tensor
        .into_data()
        .iter::<f32>()
        .next()
        .expect("non-empty tensor")
}

/// Seeded uniform values in `[-1, 1)`.
pub fn random_values(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Create a 4D tensor from flat values.
pub fn tensor4<B: Backend>(values: Vec<f32>, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Create a 5D tensor from flat values.
pub fn tensor5<B: Backend>(values: Vec<f32>, shape: [usize; 5], device: &B::Device) -> Tensor<B, 5> {
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Identity `[n, n]` matrix.
pub fn eye<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; n * n];
    for i in 0..n {
        values[i * n + i] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [n, n]), device)
}

/// Quantizer whose projections are the identity, so `forward` and
/// `forward_quantizer` see the same latents.
pub fn identity_quantizer<B: Backend>(
    codebook: Tensor<B, 2>,
    layout: SpatialLayout,
    remap: Option<RemapTable>,
    beta: f32,
    legacy: bool,
    sane_index_shape: bool,
) -> VectorQuantizer<B> {
    let device = codebook.device();
    let e_dim = codebook.dims()[1];
    let projection = || {
        Projection::new(eye::<B>(e_dim, &device), Tensor::zeros([e_dim], &device), layout)
            .expect("projection")
    };
    VectorQuantizer::new(
        Codebook::new(codebook).expect("codebook"),
        projection(),
        projection(),
        remap,
        beta,
        legacy,
        sane_index_shape,
    )
    .expect("quantizer")
}

/// Write f32 tensors to a SafeTensors file.
pub fn write_f32_safetensors(path: &Path, tensors: Vec<(&str, Vec<usize>, Vec<f32>)>) {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .into_iter()
        .map(|(name, shape, values)| {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.to_string(), shape, bytes)
        })
        .collect();
    let views: Vec<(String, TensorView<'_>)> = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes).expect("tensor view");
            (name.clone(), view)
        })
        .collect();
    let bytes = safetensors::serialize(views, &None).expect("serialize safetensors");
    std::fs::write(path, bytes).expect("write safetensors");
}

/// Default CPU device.
pub fn device() -> NdArrayDevice {
    NdArrayDevice::default()
}
