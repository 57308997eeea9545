//! Reference kernels for the nnq operator set.
//!
//! Convolutions work on NCHW tensors with `[out, in / groups, kh, kw]`
//! weights. Taps that fall into the padding are skipped, which for the
//! quantized kernel is the same as reading the input zero point.

use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD};
use nnq_ir::{Conv2d, Padding, QuantParam, QuantizedConv2d};

/// Errors raised by kernels on inconsistent operator parameters.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("input has {found} channels, weights expect {expected}")]
    ChannelMismatch { expected: usize, found: usize },
    #[error("{channels} channels cannot be split into {groups} groups")]
    BadGroups { channels: usize, groups: usize },
    #[error("bias has {found} entries, expected {expected}")]
    BiasLength { expected: usize, found: usize },
    #[error("stride and dilation must be positive")]
    ZeroStep,
    #[error("output shift {0} is outside 1..=62")]
    BadShift(i32),
}

struct Geometry {
    batch: usize,
    in_h: i64,
    in_w: i64,
    out_channels: usize,
    out_h: usize,
    out_w: usize,
    group_in: usize,
    group_out: usize,
    kernel: [usize; 2],
    padding: [Padding; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
}

impl Geometry {
    fn new(
        input: (usize, usize, usize, usize),
        weights: (usize, usize, usize, usize),
        bias_len: usize,
        groups: usize,
        padding: [Padding; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
    ) -> Result<Self, KernelError> {
        let (batch, channels, in_h, in_w) = input;
        let (out_channels, group_in, kh, kw) = weights;
        if stride.contains(&0) || dilation.contains(&0) {
            return Err(KernelError::ZeroStep);
        }
        if groups == 0 || channels % groups != 0 || out_channels % groups != 0 {
            return Err(KernelError::BadGroups { channels, groups });
        }
        if channels / groups != group_in {
            return Err(KernelError::ChannelMismatch {
                expected: group_in * groups,
                found: channels,
            });
        }
        if bias_len != out_channels {
            return Err(KernelError::BiasLength {
                expected: out_channels,
                found: bias_len,
            });
        }

        Ok(Self {
            batch,
            in_h: in_h as i64,
            in_w: in_w as i64,
            out_channels,
            out_h: nnq_ir::windowed_output_size(in_h, kh, padding[0], stride[0], dilation[0]),
            out_w: nnq_ir::windowed_output_size(in_w, kw, padding[1], stride[1], dilation[1]),
            group_in,
            group_out: out_channels / groups,
            kernel: [kh, kw],
            padding,
            stride,
            dilation,
        })
    }

    /// Input coordinate read by output position `out` and kernel tap `tap`
    /// along `axis`, or `None` inside the padding.
    fn source(&self, axis: usize, out: usize, tap: usize) -> Option<usize> {
        let pos = (out * self.stride[axis] + tap * self.dilation[axis]) as i64
            - i64::from(self.padding[axis].before);
        let limit = if axis == 0 { self.in_h } else { self.in_w };
        (0..limit).contains(&pos).then_some(pos as usize)
    }

    fn convolve<X: Copy, W: Copy, A, Y>(
        &self,
        input: &ArrayView4<X>,
        weights: &Array4<W>,
        init: impl Fn(usize) -> A,
        mac: impl Fn(A, X, W) -> A,
        finish: impl Fn(A) -> Y,
    ) -> Array4<Y> {
        let shape = (self.batch, self.out_channels, self.out_h, self.out_w);
        Array4::from_shape_fn(shape, |(n, oc, oy, ox)| {
            let first_ic = (oc / self.group_out) * self.group_in;
            let mut acc = init(oc);
            for kc in 0..self.group_in {
                for ky in 0..self.kernel[0] {
                    let Some(iy) = self.source(0, oy, ky) else {
                        continue;
                    };
                    for kx in 0..self.kernel[1] {
                        let Some(ix) = self.source(1, ox, kx) else {
                            continue;
                        };
                        acc = mac(
                            acc,
                            input[[n, first_ic + kc, iy, ix]],
                            weights[[oc, kc, ky, kx]],
                        );
                    }
                }
            }
            finish(acc)
        })
    }
}

/// Floating-point convolution.
pub fn conv2d_f32(input: &ArrayView4<f32>, conv: &Conv2d) -> Result<Array4<f32>, KernelError> {
    let geom = Geometry::new(
        input.dim(),
        conv.weights.dim(),
        conv.bias.len(),
        conv.groups,
        [conv.padding_h, conv.padding_w],
        [conv.stride_h, conv.stride_w],
        [conv.dilation_h, conv.dilation_w],
    )?;
    Ok(geom.convolve(
        input,
        &conv.weights,
        |oc| conv.bias[oc],
        |acc, x, w| acc + x * w,
        |acc| acc,
    ))
}

/// Rescale an accumulator by `mul / 2^shift`, rounding half up, and shift it
/// into the unsigned output range.
pub fn requantize(acc: i64, mul: i32, shift: i32, offset: i32) -> u8 {
    let half = 1i64 << (shift - 1);
    let scaled = acc.saturating_mul(i64::from(mul)).saturating_add(half) >> shift;
    (scaled + i64::from(offset)).clamp(0, 255) as u8
}

/// Fixed-point convolution over unsigned 8-bit codes.
///
/// `acc = bias + Σ (x + input_offset) * (w + weight_offset)` is accumulated
/// in 64 bits and then [`requantize`]d.
pub fn quantized_conv2d(
    input: &ArrayView4<u8>,
    conv: &QuantizedConv2d,
) -> Result<Array4<u8>, KernelError> {
    if !(1..=62).contains(&conv.output_shift) {
        return Err(KernelError::BadShift(conv.output_shift));
    }
    let geom = Geometry::new(
        input.dim(),
        conv.weights.dim(),
        conv.bias.len(),
        conv.groups,
        [conv.padding_h, conv.padding_w],
        [conv.stride_h, conv.stride_w],
        [conv.dilation_h, conv.dilation_w],
    )?;
    let x_off = i64::from(conv.input_offset);
    let w_off = i64::from(conv.weight_offset);
    Ok(geom.convolve(
        input,
        &conv.weights,
        |oc| i64::from(conv.bias[oc]),
        |acc, x: u8, w: u8| acc + (i64::from(x) + x_off) * (i64::from(w) + w_off),
        |acc| requantize(acc, conv.output_mul, conv.output_shift, conv.output_offset),
    ))
}

pub fn quantize(input: &ArrayViewD<f32>, param: QuantParam) -> ArrayD<u8> {
    input.mapv(|v| param.quantize_u8(v))
}

pub fn dequantize(input: &ArrayViewD<u8>, param: QuantParam) -> ArrayD<f32> {
    input.mapv(|c| param.dequantize(i32::from(c)))
}
