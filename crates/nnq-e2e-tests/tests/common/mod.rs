use std::collections::HashMap;

use ndarray::{Array, Array1, Array4, ArrayD, IxDyn};
use nnq_ir::{Attributes, Conv2d, Graph, InputId, NodeId, NodeOp, OpKind, OutputId, TensorType};
use nnq_opt::{MarkQuantizeRegion, Pass, Quantizer};
use nnq_runtime::Evaluator;

/// Build `x -> conv -> y` with `x` of shape `input`.
#[allow(dead_code)]
pub fn conv_graph(conv: Conv2d, input: [usize; 4]) -> (Graph, NodeId, NodeId) {
    let ty = TensorType::f32(input);
    let mut graph = Graph::new();
    let x = graph.add_input("x", ty.clone());
    let c = graph
        .emplace("conv", NodeOp::Conv2d(conv), &ty)
        .expect("conv construction failed");
    graph
        .connect(InputId::new(c, 0), OutputId::new(x, 0))
        .expect("connect failed");
    graph
        .add_output("y", OutputId::new(c, 0))
        .expect("output construction failed");
    (graph, x, c)
}

/// Append a conv consuming `source` and return it.
#[allow(dead_code)]
pub fn push_conv(graph: &mut Graph, name: &str, conv: Conv2d, source: OutputId) -> NodeId {
    let ty = graph.output(source).expect("bad source").ty().clone();
    let c = graph
        .emplace(name, NodeOp::Conv2d(conv), &ty)
        .expect("conv construction failed");
    graph
        .connect(InputId::new(c, 0), source)
        .expect("connect failed");
    c
}

/// Weights evenly spread over `[lo, hi]`, laid out `[oc, ic, k, k]`.
///
/// The first and last weights are exactly `lo` and `hi`.
#[allow(dead_code)]
pub fn linspace_weights(oc: usize, ic: usize, k: usize, lo: f32, hi: f32) -> Array4<f32> {
    let n = oc * ic * k * k;
    let mut w = Array::linspace(lo, hi, n)
        .into_shape_with_order((oc, ic, k, k))
        .expect("weight shape");
    w[[0, 0, 0, 0]] = lo;
    w[[oc - 1, ic - 1, k - 1, k - 1]] = hi;
    w
}

/// A single-channel 3x3 conv with weights spanning `[-0.5, 0.5]`.
#[allow(dead_code)]
pub fn scenario_a_conv() -> Conv2d {
    Conv2d::new(
        linspace_weights(2, 1, 3, -0.5, 0.5),
        Array1::from(vec![0.1, -0.05]),
    )
}

#[allow(dead_code)]
pub fn flag(graph: &mut Graph, connectors: &[OutputId]) {
    for &c in connectors {
        graph
            .output_mut(c)
            .expect("bad connector")
            .attributes
            .insert(Attributes::NEEDS_QUANTIZE);
    }
}

/// Deterministic pseudo-random values in `[-1, 1]` with the given shape.
#[allow(dead_code)]
pub fn sample(shape: [usize; 4], seed: u64) -> ArrayD<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    Array::from_shape_simple_fn(IxDyn(&shape), || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    })
}

#[allow(dead_code)]
pub fn feed(name: &str, value: ArrayD<f32>) -> HashMap<String, ArrayD<f32>> {
    HashMap::from([(name.to_string(), value)])
}

/// Record the range of every tensor the float graph produces over `samples`.
#[allow(dead_code)]
pub fn calibrate(graph: &Graph, input: &str, samples: &[ArrayD<f32>]) -> Quantizer {
    let mut quantizer = Quantizer::new();
    for s in samples {
        let eval = Evaluator::trace(graph, &feed(input, s.clone())).expect("float evaluation failed");
        for (connector, tensor) in eval.values() {
            if let Some(values) = tensor.as_f32() {
                quantizer
                    .record(connector, values.iter().copied())
                    .expect("empty tensor");
            }
        }
    }
    quantizer
}

/// Flag every conv region and calibrate it over `samples`.
#[allow(dead_code)]
pub fn prepare(graph: &mut Graph, samples: &[ArrayD<f32>]) -> Quantizer {
    MarkQuantizeRegion::default().run(graph);
    calibrate(graph, "x", samples)
}

#[allow(dead_code)]
pub fn count_kind(graph: &Graph, kind: OpKind) -> usize {
    graph.nodes().filter(|(_, n)| n.kind() == kind).count()
}

#[allow(dead_code)]
pub fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    assert_eq!(a.shape(), b.shape(), "shape mismatch");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
