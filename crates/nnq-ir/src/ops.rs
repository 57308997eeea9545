//! Operator catalog for graph nodes.

use ndarray::{Array1, Array4};

use crate::error::IrError;
use crate::quant::QuantParam;
use crate::types::{Padding, Scalar, Shape, TensorType};

/// Fieldless tag identifying an operator, used for transform dispatch.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum OpKind {
    Input,
    Output,
    Conv2d,
    Quantize,
    Dequantize,
    QuantizedConv2d,
}

impl OpKind {
    /// Short operator mnemonic used in dumps and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Conv2d => "conv2d",
            Self::Quantize => "quantize",
            Self::Dequantize => "dequantize",
            Self::QuantizedConv2d => "quantized_conv2d",
        }
    }
}

/// Floating-point 2-D convolution over NCHW tensors.
///
/// `weights` is laid out `[out_channels, in_channels / groups, kh, kw]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Conv2d {
    pub weights: Array4<f32>,
    pub bias: Array1<f32>,
    pub groups: usize,
    pub padding_h: Padding,
    pub padding_w: Padding,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
}

impl Conv2d {
    /// A dense convolution with unit stride and dilation and no padding.
    pub fn new(weights: Array4<f32>, bias: Array1<f32>) -> Self {
        Self {
            weights,
            bias,
            groups: 1,
            padding_h: Padding::ZERO,
            padding_w: Padding::ZERO,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
        }
    }

    pub fn output_channels(&self) -> usize {
        self.weights.dim().0
    }

    fn window(&self) -> Window {
        let (_, _, kh, kw) = self.weights.dim();
        Window {
            kernel: [kh, kw],
            padding: [self.padding_h, self.padding_w],
            stride: [self.stride_h, self.stride_w],
            dilation: [self.dilation_h, self.dilation_w],
        }
    }
}

/// Fixed-point 2-D convolution: the form a [`Conv2d`] is lowered to.
///
/// Inputs and weights are unsigned 8-bit codes shifted by `input_offset` and
/// `weight_offset` before the multiply; the `i32` bias is added in the
/// accumulator domain and the accumulator is rescaled by
/// `output_mul / 2^output_shift` before `output_offset` is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedConv2d {
    pub weights: Array4<u8>,
    pub bias: Array1<i32>,
    pub groups: usize,
    pub padding_h: Padding,
    pub padding_w: Padding,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub input_offset: i32,
    pub weight_offset: i32,
    pub output_mul: i32,
    pub output_shift: i32,
    pub output_offset: i32,
}

impl QuantizedConv2d {
    pub fn output_channels(&self) -> usize {
        self.weights.dim().0
    }

    fn window(&self) -> Window {
        let (_, _, kh, kw) = self.weights.dim();
        Window {
            kernel: [kh, kw],
            padding: [self.padding_h, self.padding_w],
            stride: [self.stride_h, self.stride_w],
            dilation: [self.dilation_h, self.dilation_w],
        }
    }
}

/// The operation a node performs.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOp {
    /// Graph input: no inputs, one output.
    Input,
    /// Graph output: one input, no outputs.
    Output,
    Conv2d(Conv2d),
    /// `f32 → u8` affine quantization.
    Quantize(QuantParam),
    /// `u8 → f32` affine dequantization.
    Dequantize(QuantParam),
    QuantizedConv2d(QuantizedConv2d),
}

impl NodeOp {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Input => OpKind::Input,
            Self::Output => OpKind::Output,
            Self::Conv2d(_) => OpKind::Conv2d,
            Self::Quantize(_) => OpKind::Quantize,
            Self::Dequantize(_) => OpKind::Dequantize,
            Self::QuantizedConv2d(_) => OpKind::QuantizedConv2d,
        }
    }

    /// Connector types for a node of this op fed with `ty`.
    ///
    /// For [`NodeOp::Input`], `ty` is the type the node emits.
    pub fn signature(&self, ty: &TensorType) -> Result<Signature, IrError> {
        let sig = match self {
            Self::Input => Signature {
                inputs: vec![],
                outputs: vec![ty.clone()],
            },
            Self::Output => Signature {
                inputs: vec![ty.clone()],
                outputs: vec![],
            },
            Self::Conv2d(conv) => Signature {
                inputs: vec![ty.clone()],
                outputs: vec![TensorType::new(
                    ty.scalar,
                    conv_output_shape(&ty.shape, conv.output_channels(), &conv.window())?,
                )],
            },
            Self::QuantizedConv2d(conv) => Signature {
                inputs: vec![ty.clone()],
                outputs: vec![TensorType::new(
                    ty.scalar,
                    conv_output_shape(&ty.shape, conv.output_channels(), &conv.window())?,
                )],
            },
            Self::Quantize(_) => Signature {
                inputs: vec![ty.clone()],
                outputs: vec![ty.with_scalar(Scalar::U8)],
            },
            Self::Dequantize(_) => Signature {
                inputs: vec![ty.clone()],
                outputs: vec![ty.with_scalar(Scalar::F32)],
            },
        };
        Ok(sig)
    }
}

/// Input and output connector types of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub inputs: Vec<TensorType>,
    pub outputs: Vec<TensorType>,
}

struct Window {
    kernel: [usize; 2],
    padding: [Padding; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
}

/// Spatial output size of a sliding window: `(in + pads - effective) / stride + 1`,
/// where `effective = (kernel - 1) * dilation + 1`. Saturates at zero.
pub fn windowed_output_size(
    input: usize,
    kernel: usize,
    padding: Padding,
    stride: usize,
    dilation: usize,
) -> usize {
    let effective = (kernel.max(1) as i64 - 1) * dilation.max(1) as i64 + 1;
    let padded = input as i64 + padding.sum();
    if padded < effective {
        return 0;
    }
    ((padded - effective) / stride.max(1) as i64 + 1) as usize
}

fn conv_output_shape(
    input: &Shape,
    out_channels: usize,
    window: &Window,
) -> Result<Shape, IrError> {
    let &[n, _, h, w] = &input.dims[..] else {
        return Err(IrError::TypeMismatch {
            expected: "rank-4 NCHW tensor".into(),
            found: format!("{input}"),
        });
    };
    Ok(Shape::new([
        n,
        out_channels,
        windowed_output_size(
            h,
            window.kernel[0],
            window.padding[0],
            window.stride[0],
            window.dilation[0],
        ),
        windowed_output_size(
            w,
            window.kernel[1],
            window.padding[1],
            window.stride[1],
            window.dilation[1],
        ),
    ]))
}
