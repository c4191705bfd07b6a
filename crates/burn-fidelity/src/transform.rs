//! Input preprocessing for the frozen backbone.
//!
//! Raw images are mapped to the per-channel distribution the VGG16 weights were trained
//! with, then optionally resampled to a square resolution.

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{DType, Tensor, TensorData};

/// LPIPS scaling layer shift, expressed for inputs in `[-1, 1]`.
const SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
/// LPIPS scaling layer scale, expressed for inputs in `[-1, 1]`.
const SCALE: [f32; 3] = [0.458, 0.448, 0.450];

/// Element type an input batch is required to have.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum InputDtype {
    /// 8-bit unsigned integers.
    U8,
    /// 32-bit floats.
    F32,
}

impl InputDtype {
    /// The matching tensor data type.
    pub fn dtype(&self) -> DType {
        match self {
            InputDtype::U8 => DType::U8,
            InputDtype::F32 => DType::F32,
        }
    }
}

/// Value range of the input pixels.
///
/// The range is part of the configuration and is never inferred from the data.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum InputRange {
    /// Pixels in `[0, 255]`, as stored in 8-bit images.
    Byte,
    /// Pixels in `[0, 1]`.
    Unit,
}

impl InputRange {
    /// Factor bringing a pixel of this range to `[0, 255]`.
    pub fn to_byte_scale(&self) -> f32 {
        match self {
            InputRange::Byte => 1.0,
            InputRange::Unit => 255.0,
        }
    }

    /// The largest pixel value of the range.
    pub fn max_value(&self) -> f32 {
        match self {
            InputRange::Byte => 255.0,
            InputRange::Unit => 1.0,
        }
    }
}

/// Per-channel mean of the backbone input distribution, for pixels in `[0, 255]`.
pub fn channel_mean() -> [f32; 3] {
    SHIFT.map(|shift| (1.0 + shift) * 255.0 / 2.0)
}

/// Per-channel inverse standard deviation of the backbone input distribution, for pixels in
/// `[0, 255]`.
pub fn channel_inv_std() -> [f32; 3] {
    SCALE.map(|scale| 2.0 / (scale * 255.0))
}

/// Upload a host image batch as a float tensor, whatever its element type.
pub fn to_float_tensor<B: Backend>(data: TensorData, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(data.convert::<f32>(), device)
}

/// Apply `x' = (x - mean_c) * inv_std_c` channel-wise.
///
/// # Shapes
///
/// - input: `[batch, 3, H, W]`
/// - output: `[batch, 3, H, W]`
pub fn normalize<B: Backend>(x: Tensor<B, 4>, range: InputRange) -> Tensor<B, 4> {
    let device = x.device();
    let [batch, channels, h, w] = x.dims();

    let x = match range {
        InputRange::Byte => x,
        InputRange::Unit => x.mul_scalar(range.to_byte_scale()),
    };

    let mean = Tensor::<B, 1>::from_floats(channel_mean(), &device)
        .reshape([1, channels, 1, 1])
        .expand([batch, channels, h, w]);
    let inv_std = Tensor::<B, 1>::from_floats(channel_inv_std(), &device)
        .reshape([1, channels, 1, 1])
        .expand([batch, channels, h, w]);

    x.sub(mean).mul(inv_std)
}

/// Resample a batch to `size x size`.
///
/// When both sides are larger than `size`, the image is shrunk by area averaging, which
/// anti-aliases. Otherwise bilinear interpolation with half-pixel centers (no corner
/// alignment) is used.
///
/// # Shapes
///
/// - input: `[batch, channels, H, W]`
/// - output: `[batch, channels, size, size]`
pub fn resize<B: Backend>(x: Tensor<B, 4>, size: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();

    if h > size && w > size {
        adaptive_avg_pool2d(x, [size, size])
    } else {
        bilinear(x, [size, size])
    }
}

/// Separable bilinear interpolation, expressed as `R_h · x · R_wᵀ`.
fn bilinear<B: Backend>(x: Tensor<B, 4>, output_size: [usize; 2]) -> Tensor<B, 4> {
    let device = x.device();
    let [batch, channels, h, w] = x.dims();
    let [out_h, out_w] = output_size;
    let planes = batch * channels;

    let rows = Tensor::<B, 2>::from_data(
        TensorData::new(bilinear_weights(h, out_h), [out_h, h]),
        &device,
    )
    .unsqueeze::<3>()
    .expand([planes, out_h, h]);
    let cols = Tensor::<B, 2>::from_data(
        TensorData::new(bilinear_weights(w, out_w), [out_w, w]),
        &device,
    )
    .transpose()
    .unsqueeze::<3>()
    .expand([planes, w, out_w]);

    let x = x.reshape([planes, h, w]);

    rows.matmul(x)
        .matmul(cols)
        .reshape([batch, channels, out_h, out_w])
}

/// Row-major `[output, input]` interpolation matrix.
///
/// Source coordinate of output pixel `o` is `(o + 0.5) * input / output - 0.5`, clamped at 0;
/// each row holds the two linear weights of its neighbours.
fn bilinear_weights(input: usize, output: usize) -> Vec<f32> {
    let scale = input as f64 / output as f64;
    let mut weights = vec![0.0f32; output * input];

    for o in 0..output {
        let source = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (source.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let lambda = (source - i0 as f64).clamp(0.0, 1.0);

        weights[o * input + i0] += (1.0 - lambda) as f32;
        weights[o * input + i1] += lambda as f32;
    }

    weights
}
