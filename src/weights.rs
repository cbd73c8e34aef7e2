//! Quantizer checkpoints in SafeTensors format.
//!
//! Checkpoints usually come from a larger autoencoder, so tensor names carry
//! wrapper prefixes (`model.`, `vqvae.quantize.`, ...). Loading strips them and
//! keeps only the tensors the quantizer owns.

use anyhow::{bail, ensure, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Codebook table.
pub const EMBEDDING_WEIGHT: &str = "embedding.weight";
/// Pre-quantization projection weight.
pub const QUANT_CONV_WEIGHT: &str = "quant_conv.weight";
/// Pre-quantization projection bias.
pub const QUANT_CONV_BIAS: &str = "quant_conv.bias";
/// Post-quantization projection weight.
pub const POST_QUANT_CONV_WEIGHT: &str = "post_quant_conv.weight";
/// Post-quantization projection bias.
pub const POST_QUANT_CONV_BIAS: &str = "post_quant_conv.bias";
/// Remap table stored alongside the parameters.
pub const USED_BUFFER: &str = "used";

const KNOWN_NAMES: &[&str] = &[
    EMBEDDING_WEIGHT,
    QUANT_CONV_WEIGHT,
    QUANT_CONV_BIAS,
    POST_QUANT_CONV_WEIGHT,
    POST_QUANT_CONV_BIAS,
    USED_BUFFER,
];

/// One stored tensor, still in its on-disk encoding.
#[derive(Debug, Clone)]
pub struct WeightTensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Little-endian, row-major.
    pub data: Vec<u8>,
}

impl WeightTensor {
    /// Copy a tensor out of a deserialized file.
    pub fn from_safetensor(view: TensorView<'_>) -> Self {
        Self {
            dtype: view.dtype(),
            shape: view.shape().to_vec(),
            data: view.data().to_vec(),
        }
    }

    /// Number of scalar elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode floating-point payloads (`F32` or `BF16`) into `f32`.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let values: Vec<f32> = match self.dtype {
            Dtype::F32 => self
                .data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            Dtype::BF16 => self
                .data
                .chunks_exact(2)
                .map(|chunk| {
                    let bits = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                    f32::from_bits(bits << 16)
                })
                .collect(),
            other => bail!("unsupported float dtype {other:?}"),
        };
        ensure!(
            values.len() == self.numel(),
            "tensor payload holds {} values, shape {:?} needs {}",
            values.len(),
            self.shape,
            self.numel()
        );
        Ok(values)
    }

    /// Decode integer payloads into `i64`.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        let values: Vec<i64> = match self.dtype {
            Dtype::I64 => self
                .data
                .chunks_exact(8)
                .map(|chunk| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(chunk);
                    i64::from_le_bytes(buf)
                })
                .collect(),
            Dtype::I32 => self
                .data
                .chunks_exact(4)
                .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64)
                .collect(),
            other => bail!("unsupported integer dtype {other:?}"),
        };
        ensure!(
            values.len() == self.numel(),
            "tensor payload holds {} values, shape {:?} needs {}",
            values.len(),
            self.shape,
            self.numel()
        );
        Ok(values)
    }

    /// Decode into a float tensor of the requested shape.
    ///
    /// The element count must match; the stored shape may differ only by
    /// trailing unit axes (a `[out, in, 1, 1]` conv kernel loads as `[out, in]`).
    pub fn to_tensor<B: Backend, const D: usize>(
        &self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let (head, tail) = self.shape.split_at(self.shape.len().min(D));
        ensure!(
            head == shape.as_slice() && tail.iter().all(|&dim| dim == 1),
            "tensor shape {:?} is incompatible with expected {shape:?}",
            self.shape
        );
        let values = self.to_f32_vec()?;
        Ok(Tensor::from_data(TensorData::new(values, shape), device))
    }
}

/// Read a checkpoint, keeping quantizer tensors under their canonical names.
///
/// Tensors belonging to the rest of the autoencoder are skipped.
pub fn load_quantizer_state_dict(
    path: impl AsRef<Path>,
) -> Result<HashMap<String, WeightTensor>> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
    let file = SafeTensors::deserialize(&bytes)?;

    let mut state = HashMap::new();
    for (stored, view) in file.tensors() {
        let Some(canonical) = map_quantizer_name(&stored) else {
            tracing::trace!(name = %stored, "skipping non-quantizer tensor");
            continue;
        };
        tracing::debug!(source = %stored, target = canonical, "mapped quantizer tensor");
        if state
            .insert(canonical.to_string(), WeightTensor::from_safetensor(view))
            .is_some()
        {
            bail!("checkpoint stores `{canonical}` more than once");
        }
    }
    Ok(state)
}

/// Canonical quantizer name for a stored tensor, if it is one.
fn map_quantizer_name(name: &str) -> Option<&'static str> {
    const WRAPPER_PREFIXES: &[&str] = &[
        "model.",
        "module.",
        "vqvae.",
        "quantizer.",
        "quantize.",
        "vector_quantizer.",
    ];
    const ALIASES: &[(&str, &str)] = &[("codebook.weight", EMBEDDING_WEIGHT)];

    let mut name = name;
    while let Some(rest) = WRAPPER_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
    {
        name = rest;
    }

    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .or_else(|| KNOWN_NAMES.iter().find(|known| **known == name).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn write_checkpoint(path: &Path, names: &[&str], data: &[u8]) {
        let view = TensorView::new(Dtype::F32, vec![2], data).expect("tensor view");
        let views: Vec<(String, TensorView<'_>)> = names
            .iter()
            .map(|name| (name.to_string(), view.clone()))
            .collect();
        let bytes = safetensors::serialize(views, &None).expect("serialize safetensors");
        fs::write(path, bytes).expect("write safetensors");
    }

    #[test]
    fn loading_strips_wrappers_and_skips_foreign_tensors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vq.safetensors");
        let data = f32_bytes(&[0.0, 1.0]);
        write_checkpoint(
            &path,
            &[
                "model.quantize.embedding.weight",
                "vqvae.quant_conv.bias",
                "model.decoder.conv_in.weight",
            ],
            &data,
        );

        let state = load_quantizer_state_dict(&path).expect("load quantizer state");
        let mut keys: Vec<_> = state.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![EMBEDDING_WEIGHT, QUANT_CONV_BIAS]);
        assert_eq!(state[EMBEDDING_WEIGHT].to_f32_vec().expect("decode"), vec![0.0, 1.0]);
    }

    #[test]
    fn alias_colliding_with_canonical_name_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vq.safetensors");
        let data = f32_bytes(&[0.0, 1.0]);
        write_checkpoint(
            &path,
            &["quantize.embedding.weight", "quantizer.codebook.weight"],
            &data,
        );
        let err = load_quantizer_state_dict(&path).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn missing_checkpoint_names_the_path() {
        let err = load_quantizer_state_dict("does/not/exist.safetensors").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.safetensors"));
    }

    #[test]
    fn names_map_to_canonical_parameters() {
        assert_eq!(
            map_quantizer_name("module.post_quant_conv.weight"),
            Some(POST_QUANT_CONV_WEIGHT)
        );
        assert_eq!(map_quantizer_name("quantize.used"), Some(USED_BUFFER));
        assert_eq!(map_quantizer_name("codebook.weight"), Some(EMBEDDING_WEIGHT));
        assert_eq!(map_quantizer_name("encoder.conv_out.weight"), None);
    }

    #[test]
    fn bf16_conv_kernel_loads_as_matrix() {
        let values = [1.0_f32, -0.5, 2.25, 4.0];
        let data = values
            .iter()
            .flat_map(|value| ((value.to_bits() >> 16) as u16).to_le_bytes())
            .collect();
        let kernel = WeightTensor {
            dtype: Dtype::BF16,
            shape: vec![2, 2, 1, 1],
            data,
        };
        let device = NdArrayDevice::default();
        let decoded: Tensor<NdArray<f32>, 2> = kernel.to_tensor([2, 2], &device).expect("decode");
        let decoded = decoded.into_data();
        assert_eq!(decoded.as_slice::<f32>().expect("slice"), &values);

        assert!(kernel.to_tensor::<NdArray<f32>, 2>([4, 1], &device).is_err());
    }

    #[test]
    fn integer_buffers_decode() {
        let data: Vec<u8> = [5i64, -1].iter().flat_map(|v| v.to_le_bytes()).collect();
        let used = WeightTensor {
            dtype: Dtype::I64,
            shape: vec![2],
            data,
        };
        assert_eq!(used.to_i64_vec().expect("decode"), vec![5, -1]);
        assert!(used.to_f32_vec().is_err());
    }
}
