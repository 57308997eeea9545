//! Lowering of floating-point convolutions to fixed point.
//!
//! A `conv2d` whose input and output tensors are both flagged
//! [`Attributes::NEEDS_QUANTIZE`] is replaced by the chain
//!
//! ```text
//! P.out -> quantize -> quantized_conv2d -> dequantize -> consumers of C.out
//! ```
//!
//! Weights become unsigned 8-bit codes with their own affine parameters,
//! the bias is moved to the `i32` accumulator scale, and the accumulator is
//! rescaled to the output scale by an integer `mantissa >> shift`.

use ndarray::{Array1, Array4};
use nnq_ir::{
    Attributes, Conv2d, FixedMul, Graph, InputId, NodeId, NodeOp, OpKind, OutputId, QuantParam,
    QuantizedConv2d, Scalar,
};

use crate::quantizer::{QuantizeError, Quantizer};
use crate::{QuantConfig, Transform, TransformContext, TransformError, link};

/// Quantized weights and the affine parameters they were encoded with.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedWeights {
    pub quant_param: QuantParam,
    pub weights: Array4<u8>,
}

/// Bias at accumulator scale and the accumulator-to-output multiplier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuantizedBias {
    pub bias: Array1<i32>,
    pub fixed_mul: FixedMul,
}

/// Encode `weights` as unsigned codes over their own (normalized) range.
pub fn quantize_weights(
    quantizer: &Quantizer,
    weights: &Array4<f32>,
    bits: u32,
) -> Result<QuantizedWeights, QuantizeError> {
    if bits > 8 {
        return Err(QuantizeError::UnsupportedBits(bits));
    }
    let range = quantizer.fixup_range(quantizer.get_range(weights.iter().copied())?)?;
    let quant_param = quantizer.get_quant_param(range, bits)?;
    let q_max = ((1u32 << bits) - 1) as f32;
    let zero_point = quant_param.zero_point as f32;
    let weights = weights.mapv(|w| {
        (w / quant_param.scale + zero_point)
            .round()
            .clamp(0.0, q_max) as u8
    });
    Ok(QuantizedWeights {
        quant_param,
        weights,
    })
}

/// Move `bias` to the accumulator scale `input.scale * weights.scale` and
/// derive the multiplier taking accumulator units to `output` units.
pub fn quantize_bias(
    quantizer: &Quantizer,
    bias: &Array1<f32>,
    input: QuantParam,
    weights: QuantParam,
    output: QuantParam,
    config: &QuantConfig,
) -> Result<QuantizedBias, QuantizeError> {
    let acc_scale = input.scale * weights.scale;

    let mut quantized = Array1::zeros(bias.len());
    for (q, &b) in quantized.iter_mut().zip(bias.iter()) {
        let value = f64::from((b / acc_scale).round());
        if !(f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&value) {
            return Err(QuantizeError::BiasOverflow {
                value: b,
                scale: acc_scale,
            });
        }
        *q = value as i32;
    }

    let ratio = acc_scale / output.scale;
    let fixed_mul =
        quantizer.get_fixed_mul(ratio, config.multiplier_bits, config.multiplier_max, true)?;
    if fixed_mul.shift <= 0 {
        return Err(QuantizeError::NonPositiveShift {
            ratio,
            mantissa: fixed_mul.mantissa,
            shift: fixed_mul.shift,
        });
    }

    Ok(QuantizedBias {
        bias: quantized,
        fixed_mul,
    })
}

/// Rewrites flagged `conv2d` nodes into quantize / quantized_conv2d /
/// dequantize chains using calibration ranges from a [`Quantizer`].
#[derive(Debug)]
pub struct QuantizedConv2dTransform<'q> {
    quantizer: &'q mut Quantizer,
    config: QuantConfig,
}

impl<'q> QuantizedConv2dTransform<'q> {
    pub fn new(quantizer: &'q mut Quantizer, config: QuantConfig) -> Self {
        Self { quantizer, config }
    }

    fn mismatch(&self, reason: &'static str) -> TransformError {
        TransformError::PatternMismatch {
            transform: self.name().to_string(),
            reason,
        }
    }
}

fn flagged(graph: &Graph, output: OutputId) -> bool {
    graph
        .output(output)
        .is_ok_and(|o| o.attributes.contains(Attributes::NEEDS_QUANTIZE))
}

impl Transform for QuantizedConv2dTransform<'_> {
    fn name(&self) -> &str {
        "quantized-conv2d"
    }

    fn ops(&self) -> &[OpKind] {
        &[OpKind::Conv2d]
    }

    fn on_try_match(&self, graph: &Graph, node: NodeId, ctx: &mut TransformContext) -> bool {
        let Ok(conv) = graph.node(node) else {
            return false;
        };
        if conv.kind() != OpKind::Conv2d {
            return false;
        }
        let input = InputId::new(node, 0);
        let output = OutputId::new(node, 0);
        let Ok(Some(source)) = graph.producer(input) else {
            return false;
        };
        if !flagged(graph, source) || !flagged(graph, output) {
            return false;
        }

        ctx.matched_nodes.push(node);
        ctx.inputs.push(input);
        ctx.outputs.push(output);
        true
    }

    fn process(
        &mut self,
        graph: &mut Graph,
        ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        let (Some(&node), Some(&input), Some(&output)) = (
            ctx.matched_nodes.first(),
            ctx.inputs.first(),
            ctx.outputs.first(),
        ) else {
            return Err(self.mismatch("context is missing the conv2d node or its connectors"));
        };
        let conv: Conv2d = match graph.node(node)?.op() {
            NodeOp::Conv2d(conv) => conv.clone(),
            _ => return Err(self.mismatch("matched node is not a conv2d")),
        };
        let Some(source) = graph.producer(input)? else {
            return Err(self.mismatch("conv2d input is unconnected"));
        };

        let name = graph[node].name().to_string();
        let source_name = graph[source.node].name().to_string();
        let wrap = |source: QuantizeError| TransformError::Quantize {
            node: name.clone(),
            source,
        };

        let bits = self.config.bits;
        let iq = self.quantizer.get(source).map_err(wrap)?;
        let iq_p = self.quantizer.get_quant_param(iq, bits).map_err(wrap)?;
        let qw = quantize_weights(self.quantizer, &conv.weights, bits).map_err(wrap)?;
        let yq = self.quantizer.get(output).map_err(wrap)?;
        let yq_p = self.quantizer.get_quant_param(yq, bits).map_err(wrap)?;
        let qb = quantize_bias(
            self.quantizer,
            &conv.bias,
            iq_p,
            qw.quant_param,
            yq_p,
            &self.config,
        )
        .map_err(wrap)?;

        log::debug!(
            "{name}: input {iq} ({iq_p}), weights ({}), output {yq} ({yq_p}), rescale {}",
            qw.quant_param,
            qb.fixed_mul
        );

        let input_ty = graph.output(source)?.ty().clone();
        let quantize = graph.emplace(
            format!("{source_name}/quantize"),
            NodeOp::Quantize(iq_p),
            &input_ty,
        )?;
        let qconv = graph.emplace(
            name.as_str(),
            NodeOp::QuantizedConv2d(QuantizedConv2d {
                weights: qw.weights,
                bias: qb.bias,
                groups: conv.groups,
                padding_h: conv.padding_h,
                padding_w: conv.padding_w,
                stride_h: conv.stride_h,
                stride_w: conv.stride_w,
                dilation_h: conv.dilation_h,
                dilation_w: conv.dilation_w,
                input_offset: -iq_p.zero_point,
                weight_offset: -qw.quant_param.zero_point,
                output_mul: qb.fixed_mul.mantissa,
                output_shift: qb.fixed_mul.shift,
                output_offset: yq_p.zero_point,
            }),
            &input_ty.with_scalar(Scalar::U8),
        )?;
        let qconv_ty = graph[qconv].outputs()[0].ty().clone();
        let dequantize = graph.emplace(
            format!("{name}/dequantize"),
            NodeOp::Dequantize(yq_p),
            &qconv_ty,
        )?;
        let result = OutputId::new(dequantize, 0);
        link(graph, output, result, Some(&mut *self.quantizer))?;

        // Snapshot before rewiring: connect() edits the fan-out being walked.
        let consumers: Vec<InputId> = graph.consumers(output)?.to_vec();
        graph.connect(InputId::new(qconv, 0), OutputId::new(quantize, 0))?;
        graph.connect(InputId::new(dequantize, 0), OutputId::new(qconv, 0))?;
        graph.connect(InputId::new(quantize, 0), source)?;
        for consumer in &consumers {
            graph.connect(*consumer, result)?;
        }

        log::debug!(
            "{name}: replaced by {quantize} -> {qconv} -> {dequantize}, {} consumers moved",
            consumers.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use nnq_ir::{TensorType, ValueRange};
    use proptest::prelude::*;

    /// `x -> conv -> y` with both conv connectors flagged and calibrated.
    fn flagged_conv(weights: Array4<f32>, bias: Array1<f32>) -> (Graph, Quantizer, NodeId) {
        let (_, ic, _, _) = weights.dim();
        let ty = TensorType::f32([1, ic, 4, 4]);
        let mut graph = Graph::new();
        let x = graph.add_input("x", ty.clone());
        let conv = graph
            .emplace("conv", NodeOp::Conv2d(Conv2d::new(weights, bias)), &ty)
            .unwrap();
        graph
            .connect(InputId::new(conv, 0), OutputId::new(x, 0))
            .unwrap();
        graph.add_output("y", OutputId::new(conv, 0)).unwrap();
        for out in [OutputId::new(x, 0), OutputId::new(conv, 0)] {
            graph.output_mut(out).unwrap().attributes = Attributes::NEEDS_QUANTIZE;
        }

        let mut q = Quantizer::new();
        q.set_range(OutputId::new(x, 0), ValueRange::new(-1.0, 1.0));
        q.set_range(OutputId::new(conv, 0), ValueRange::new(0.0, 6.0));
        (graph, q, conv)
    }

    fn unit_weights() -> Array4<f32> {
        Array::from_shape_vec((2, 1, 1, 1), vec![-0.5, 0.5]).unwrap()
    }

    #[test]
    fn matches_flagged_conv_only() {
        let (mut graph, mut q, conv) = flagged_conv(unit_weights(), Array1::zeros(2));
        let t = QuantizedConv2dTransform::new(&mut q, QuantConfig::default());

        let mut ctx = TransformContext::default();
        assert!(t.on_try_match(&graph, conv, &mut ctx));
        assert_eq!(ctx.matched_nodes, vec![conv]);
        assert_eq!(ctx.inputs, vec![InputId::new(conv, 0)]);
        assert_eq!(ctx.outputs, vec![OutputId::new(conv, 0)]);

        let x = graph.find("x").unwrap();
        assert!(!t.on_try_match(&graph, x, &mut TransformContext::default()));

        graph.output_mut(OutputId::new(conv, 0)).unwrap().attributes = Attributes::EMPTY;
        assert!(!t.on_try_match(&graph, conv, &mut TransformContext::default()));
    }

    #[test]
    fn unconnected_conv_does_not_match() {
        let (mut graph, mut q, conv) = flagged_conv(unit_weights(), Array1::zeros(2));
        graph.disconnect(InputId::new(conv, 0)).unwrap();
        let t = QuantizedConv2dTransform::new(&mut q, QuantConfig::default());
        assert!(!t.on_try_match(&graph, conv, &mut TransformContext::default()));
    }

    #[test]
    fn process_builds_quantized_chain() {
        let (mut graph, mut q, conv) = flagged_conv(unit_weights(), Array1::from(vec![0.1, -0.2]));
        let before = graph.node_count();
        let mut t = QuantizedConv2dTransform::new(&mut q, QuantConfig::default());
        let mut ctx = TransformContext::default();
        assert!(t.on_try_match(&graph, conv, &mut ctx));
        t.process(&mut graph, &ctx).unwrap();
        drop(t);

        assert_eq!(graph.node_count(), before + 3);
        let quantize = graph.find("x/quantize").unwrap();
        let dequantize = graph.find("conv/dequantize").unwrap();
        let qconv = graph
            .nodes()
            .find(|(_, n)| n.kind() == OpKind::QuantizedConv2d)
            .map(|(id, _)| id)
            .unwrap();
        assert_eq!(graph[qconv].name(), "conv");

        let NodeOp::QuantizedConv2d(qc) = graph[qconv].op() else {
            panic!("expected quantized_conv2d");
        };
        assert_eq!(qc.input_offset, -128);
        assert_eq!(qc.weight_offset, -128);
        assert_eq!(qc.output_offset, 0);
        assert_eq!((qc.output_mul, qc.output_shift), (171, 17));
        // -0.5 lands half a step above code 0 once the zero point is rounded.
        assert!(qc.weights[[0, 0, 0, 0]] <= 1);
        assert_eq!(qc.weights[[1, 0, 0, 0]], 255);

        let y = graph.find("y").unwrap();
        assert_eq!(
            graph.producer(InputId::new(y, 0)).unwrap(),
            Some(OutputId::new(dequantize, 0))
        );
        assert_eq!(
            graph.producer(InputId::new(qconv, 0)).unwrap(),
            Some(OutputId::new(quantize, 0))
        );
        assert!(graph.consumers(OutputId::new(conv, 0)).unwrap().is_empty());
        assert!(!graph.reachable().contains(&conv));
        assert_eq!(
            graph[dequantize].outputs()[0].ty(),
            graph[conv].outputs()[0].ty()
        );
        assert!(q.contains(OutputId::new(dequantize, 0)));
    }

    #[test]
    fn missing_output_calibration_is_fatal() {
        let (mut graph, _, conv) = flagged_conv(unit_weights(), Array1::zeros(2));
        let x = graph.find("x").unwrap();
        let mut q = Quantizer::new();
        q.set_range(OutputId::new(x, 0), ValueRange::new(-1.0, 1.0));
        let before = graph.node_count();

        let mut t = QuantizedConv2dTransform::new(&mut q, QuantConfig::default());
        let mut ctx = TransformContext::default();
        assert!(t.on_try_match(&graph, conv, &mut ctx));
        let err = t.process(&mut graph, &ctx).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Quantize {
                ref node,
                source: QuantizeError::MissingCalibration { .. },
            } if node == "conv"
        ));
        assert_eq!(graph.node_count(), before);
    }

    #[test]
    fn empty_context_is_rejected() {
        let (mut graph, mut q, _) = flagged_conv(unit_weights(), Array1::zeros(2));
        let mut t = QuantizedConv2dTransform::new(&mut q, QuantConfig::default());
        let err = t
            .process(&mut graph, &TransformContext::default())
            .unwrap_err();
        assert!(matches!(err, TransformError::PatternMismatch { .. }));
    }

    #[test]
    fn weights_all_zero() {
        let q = Quantizer::new();
        let qw = quantize_weights(&q, &Array4::zeros((2, 1, 3, 3)), 8).unwrap();
        assert!(qw.quant_param.scale > 0.0);
        assert!(qw.weights.iter().all(|&w| w == 0));
    }

    #[test]
    fn weights_keep_shape() {
        let q = Quantizer::new();
        let w = Array::from_shape_fn((3, 2, 2, 2), |(o, i, h, k)| {
            (o as f32 - 1.0) * 0.3 + (i + h + k) as f32 * 0.05
        });
        let qw = quantize_weights(&q, &w, 8).unwrap();
        assert_eq!(qw.weights.dim(), w.dim());
    }

    #[test]
    fn weights_reject_wide_bits() {
        let q = Quantizer::new();
        assert!(matches!(
            quantize_weights(&q, &unit_weights(), 12),
            Err(QuantizeError::UnsupportedBits(12))
        ));
    }

    #[test]
    fn bias_overflow() {
        let q = Quantizer::new();
        let tiny = QuantParam {
            scale: 1e-6,
            zero_point: 0,
        };
        let err = quantize_bias(
            &q,
            &Array1::from(vec![1e6]),
            tiny,
            tiny,
            tiny,
            &QuantConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, QuantizeError::BiasOverflow { .. }));
    }

    #[test]
    fn bias_needs_positive_shift() {
        let q = Quantizer::new();
        let p = |scale| QuantParam {
            scale,
            zero_point: 0,
        };
        // Accumulator step 1.0 against output step 0.001: ratio 1000.
        let err = quantize_bias(
            &q,
            &Array1::zeros(1),
            p(1.0),
            p(1.0),
            p(0.001),
            &QuantConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, QuantizeError::NonPositiveShift { shift, .. } if shift <= 0));
    }

    #[test]
    fn bias_at_accumulator_scale() {
        let q = Quantizer::new();
        let p = |scale| QuantParam {
            scale,
            zero_point: 0,
        };
        let qb = quantize_bias(
            &q,
            &Array1::from(vec![0.25, -0.5, 0.0]),
            p(0.5),
            p(0.25),
            p(1.0),
            &QuantConfig::default(),
        )
        .unwrap();
        assert_eq!(qb.bias.to_vec(), vec![2, -4, 0]);
        assert_eq!(qb.fixed_mul.value(), 0.125);
    }

    proptest! {
        #[test]
        fn prop_weights_bounded_and_deterministic(
            values in proptest::collection::vec(-10f32..10.0, 1..64)
        ) {
            let q = Quantizer::new();
            let n = values.len();
            let w = Array4::from_shape_vec((n, 1, 1, 1), values).unwrap();
            let a = quantize_weights(&q, &w, 8).unwrap();
            let b = quantize_weights(&q, &w, 8).unwrap();
            prop_assert_eq!(&a, &b);
            // Every weight decodes to within one step of its real value.
            for (&code, &real) in a.weights.iter().zip(w.iter()) {
                let back = a.quant_param.dequantize(i32::from(code));
                prop_assert!((back - real).abs() <= a.quant_param.scale);
            }
        }
    }
}
