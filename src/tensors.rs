//! Small tensor helpers shared by the quantizer and the CLI.

use anyhow::{anyhow, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

/// Convert a runtime shape into a fixed-rank one.
pub fn fixed_dims<const D: usize>(dims: &[usize]) -> Result<[usize; D]> {
    dims.try_into()
        .map_err(|_| anyhow!("expected a rank-{D} shape, got {dims:?}"))
}

/// Build an int tensor from host values.
pub fn int_tensor<B: Backend, const D: usize>(
    values: Vec<i64>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Copy an int tensor back to the host.
pub fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

/// Copy a float tensor back to the host as `f32`.
pub fn float_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Create a float tensor with shape `[rows, cols]`, allowing zero rows.
pub fn empty_rows<B: Backend>(rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2> {
    if rows == 0 {
        Tensor::from_data(TensorData::new(Vec::<f32>::new(), [rows, cols]), device)
    } else {
        Tensor::zeros([rows, cols], device)
    }
}

/// Axis order moving the channel axis (1) to the end: `b c ... -> b ... c`.
pub fn channels_last_axes<const D: usize>() -> [isize; D] {
    let mut axes = [0isize; D];
    for (slot, axis) in axes.iter_mut().enumerate().skip(1) {
        *axis = if slot == D - 1 { 1 } else { slot as isize + 1 };
    }
    axes
}

/// Axis order moving the last axis back to position 1: `b ... c -> b c ...`.
pub fn channels_first_axes<const D: usize>() -> [isize; D] {
    let mut axes = [0isize; D];
    for (slot, axis) in axes.iter_mut().enumerate().skip(1) {
        *axis = if slot == 1 { D as isize - 1 } else { slot as isize - 1 };
    }
    axes
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn axis_orders_are_inverse() {
        assert_eq!(channels_last_axes::<4>(), [0, 2, 3, 1]);
        assert_eq!(channels_first_axes::<4>(), [0, 3, 1, 2]);
        assert_eq!(channels_last_axes::<5>(), [0, 2, 3, 4, 1]);
        assert_eq!(channels_first_axes::<5>(), [0, 4, 1, 2, 3]);
    }

    #[test]
    fn permutes_round_trip_values() {
        let device = NdArrayDevice::default();
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let tensor = Tensor::<NdArray<f32>, 4>::from_data(
            TensorData::new(values.clone(), [1, 2, 3, 4]),
            &device,
        );
        let last = tensor.permute(channels_last_axes::<4>());
        assert_eq!(last.dims(), [1, 3, 4, 2]);
        let back = last.permute(channels_first_axes::<4>());
        assert_eq!(back.dims(), [1, 2, 3, 4]);
        assert_eq!(float_values(back), values);
    }

    #[test]
    fn int_helpers_round_trip() {
        let device = NdArrayDevice::default();
        let tensor = int_tensor::<NdArray<f32>, 2>(vec![3, 1, 4, 1], [2, 2], &device);
        assert_eq!(tensor.dims(), [2, 2]);
        assert_eq!(int_values(tensor), vec![3, 1, 4, 1]);
        assert_eq!(empty_rows::<NdArray<f32>>(0, 3, &device).dims(), [0, 3]);
    }
}
