use std::collections::HashMap;

use ndarray::{ArrayD, ArrayView4, ArrayViewD, Ix4};
use nnq_ir::{Graph, InputId, Node, NodeId, NodeOp, OutputId, Scalar, TensorType};

use crate::error::RuntimeError;
use crate::kernels::{self, KernelError};

/// A tensor value flowing along a graph edge.
#[derive(Clone, Debug, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    U8(ArrayD<u8>),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(a) => a.shape(),
            Self::U8(a) => a.shape(),
        }
    }

    pub fn scalar(&self) -> Scalar {
        match self {
            Self::F32(_) => Scalar::F32,
            Self::U8(_) => Scalar::U8,
        }
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.scalar(), self.shape())
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::F32(a) => Some(a),
            Self::U8(_) => None,
        }
    }

    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        match self {
            Self::U8(a) => Some(a),
            Self::F32(_) => None,
        }
    }

    /// The values as `f32`. Quantized codes are converted, not dequantized.
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Self::F32(a) => a.clone(),
            Self::U8(a) => a.mapv(f32::from),
        }
    }
}

/// Every tensor computed by an evaluation, plus the graph outputs by name.
#[derive(Clone, Debug, Default)]
pub struct Evaluation {
    values: HashMap<OutputId, Tensor>,
    outputs: HashMap<String, ArrayD<f32>>,
}

impl Evaluation {
    /// The value of a named graph output.
    pub fn output(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.outputs.get(name)
    }

    /// The tensor produced by an output connector.
    pub fn value(&self, connector: OutputId) -> Option<&Tensor> {
        self.values.get(&connector)
    }

    /// Iterates over every computed `(connector, tensor)` pair.
    pub fn values(&self) -> impl Iterator<Item = (OutputId, &Tensor)> {
        self.values.iter().map(|(&c, t)| (c, t))
    }

    pub fn into_outputs(self) -> HashMap<String, ArrayD<f32>> {
        self.outputs
    }

    /// The value feeding input #0 of `id`, checked against the connector type.
    fn operand(&self, graph: &Graph, id: NodeId) -> Result<&Tensor, RuntimeError> {
        let node = &graph[id];
        let input = InputId::new(id, 0);
        let value = graph
            .producer(input)?
            .and_then(|src| self.values.get(&src))
            .ok_or_else(|| RuntimeError::Unconnected {
                node: node.name().to_string(),
                index: 0,
            })?;
        check_type(node, graph.input(input)?.ty(), value)?;
        Ok(value)
    }
}

fn check_type(node: &Node, expected: &TensorType, value: &Tensor) -> Result<(), RuntimeError> {
    let found = value.ty();
    if &found != expected {
        return Err(RuntimeError::TypeMismatch {
            node: node.name().to_string(),
            expected: expected.clone(),
            found,
        });
    }
    Ok(())
}

fn mismatch(node: &Node, expected: Scalar, value: &Tensor) -> RuntimeError {
    RuntimeError::TypeMismatch {
        node: node.name().to_string(),
        expected: value.ty().with_scalar(expected),
        found: value.ty(),
    }
}

fn f32_operand<'t>(node: &Node, value: &'t Tensor) -> Result<ArrayViewD<'t, f32>, RuntimeError> {
    value
        .as_f32()
        .map(|a| a.view())
        .ok_or_else(|| mismatch(node, Scalar::F32, value))
}

fn u8_operand<'t>(node: &Node, value: &'t Tensor) -> Result<ArrayViewD<'t, u8>, RuntimeError> {
    value
        .as_u8()
        .map(|a| a.view())
        .ok_or_else(|| mismatch(node, Scalar::U8, value))
}

fn nchw<'t, T>(
    node: &Node,
    view: ArrayViewD<'t, T>,
    value: &Tensor,
) -> Result<ArrayView4<'t, T>, RuntimeError> {
    view.into_dimensionality::<Ix4>()
        .map_err(|_| RuntimeError::TypeMismatch {
            node: node.name().to_string(),
            expected: TensorType::new(value.scalar(), [0, 0, 0, 0]),
            found: value.ty(),
        })
}

fn kernel_error(node: &Node) -> impl FnOnce(KernelError) -> RuntimeError + '_ {
    move |source| RuntimeError::Kernel {
        node: node.name().to_string(),
        source,
    }
}

/// Executes graphs node by node in topological order.
#[derive(Debug)]
pub struct Evaluator;

impl Evaluator {
    /// Evaluate `graph` and return its outputs by name.
    pub fn run(
        graph: &Graph,
        inputs: &HashMap<String, ArrayD<f32>>,
    ) -> Result<HashMap<String, ArrayD<f32>>, RuntimeError> {
        Ok(Self::trace(graph, inputs)?.into_outputs())
    }

    /// Evaluate `graph`, keeping every intermediate tensor.
    ///
    /// Only nodes reachable from the graph outputs are executed. Graph
    /// inputs are looked up by node name.
    pub fn trace(
        graph: &Graph,
        inputs: &HashMap<String, ArrayD<f32>>,
    ) -> Result<Evaluation, RuntimeError> {
        let order = graph.topological_order()?;
        let mut eval = Evaluation::default();

        for id in order {
            let node = &graph[id];
            let value = match node.op() {
                NodeOp::Input => inputs
                    .get(node.name())
                    .map(|a| Tensor::F32(a.clone()))
                    .ok_or_else(|| RuntimeError::MissingInput(node.name().to_string()))?,
                NodeOp::Output => {
                    let value = eval.operand(graph, id)?.to_f32();
                    eval.outputs.insert(node.name().to_string(), value);
                    continue;
                }
                NodeOp::Conv2d(conv) => {
                    let x = eval.operand(graph, id)?;
                    let view = nchw(node, f32_operand(node, x)?, x)?;
                    let y = kernels::conv2d_f32(&view, conv).map_err(kernel_error(node))?;
                    Tensor::F32(y.into_dyn())
                }
                NodeOp::QuantizedConv2d(conv) => {
                    let x = eval.operand(graph, id)?;
                    let view = nchw(node, u8_operand(node, x)?, x)?;
                    let y = kernels::quantized_conv2d(&view, conv).map_err(kernel_error(node))?;
                    Tensor::U8(y.into_dyn())
                }
                NodeOp::Quantize(param) => {
                    let x = eval.operand(graph, id)?;
                    Tensor::U8(kernels::quantize(&f32_operand(node, x)?, *param))
                }
                NodeOp::Dequantize(param) => {
                    let x = eval.operand(graph, id)?;
                    Tensor::F32(kernels::dequantize(&u8_operand(node, x)?, *param))
                }
            };

            let output = OutputId::new(id, 0);
            check_type(node, graph.output(output)?.ty(), &value)?;
            log::trace!("{id} '{}' -> {}", node.name(), value.ty());
            eval.values.insert(output, value);
        }

        Ok(eval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array1, Array4, IxDyn};
    use nnq_ir::{Conv2d, QuantParam};

    fn inputs(name: &str, value: ArrayD<f32>) -> HashMap<String, ArrayD<f32>> {
        HashMap::from([(name.to_string(), value)])
    }

    fn conv_graph() -> Graph {
        let ty = TensorType::f32([1, 1, 2, 2]);
        let mut graph = Graph::new();
        let x = graph.add_input("x", ty.clone());
        let conv = Conv2d::new(Array4::from_elem((1, 1, 1, 1), 2.0), Array1::from(vec![1.0]));
        let c = graph.emplace("conv", NodeOp::Conv2d(conv), &ty).unwrap();
        graph
            .connect(InputId::new(c, 0), OutputId::new(x, 0))
            .unwrap();
        graph.add_output("y", OutputId::new(c, 0)).unwrap();
        graph
    }

    #[test]
    fn runs_float_conv() {
        let graph = conv_graph();
        let x = Array::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let out = Evaluator::run(&graph, &inputs("x", x)).unwrap();
        assert_eq!(out["y"].as_slice().unwrap(), &[1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn trace_keeps_intermediates() {
        let graph = conv_graph();
        let x = ArrayD::zeros(IxDyn(&[1, 1, 2, 2]));
        let eval = Evaluator::trace(&graph, &inputs("x", x)).unwrap();
        let conv = graph.find("conv").unwrap();
        let y = eval.value(OutputId::new(conv, 0)).unwrap();
        assert_eq!(y.scalar(), Scalar::F32);
        assert!(y.as_f32().unwrap().iter().all(|&v| v == 1.0));
        assert_eq!(eval.values().count(), 2);
        assert!(eval.output("y").is_some());
    }

    #[test]
    fn missing_input() {
        let graph = conv_graph();
        assert!(matches!(
            Evaluator::run(&graph, &HashMap::new()),
            Err(RuntimeError::MissingInput(name)) if name == "x"
        ));
    }

    #[test]
    fn wrong_input_shape() {
        let graph = conv_graph();
        let x = ArrayD::zeros(IxDyn(&[1, 1, 3, 3]));
        assert!(matches!(
            Evaluator::run(&graph, &inputs("x", x)),
            Err(RuntimeError::TypeMismatch { ref node, .. }) if node == "x"
        ));
    }

    #[test]
    fn dangling_output() {
        let mut graph = conv_graph();
        let y = graph.find("y").unwrap();
        graph.disconnect(InputId::new(y, 0)).unwrap();
        let x = ArrayD::zeros(IxDyn(&[1, 1, 2, 2]));
        assert!(matches!(
            Evaluator::run(&graph, &inputs("x", x)),
            Err(RuntimeError::Unconnected { ref node, index: 0 }) if node == "y"
        ));
    }

    #[test]
    fn quantize_dequantize_round_trip() {
        let ty = TensorType::f32([4]);
        let p = QuantParam {
            scale: 0.25,
            zero_point: 4,
        };
        let mut graph = Graph::new();
        let x = graph.add_input("x", ty.clone());
        let q = graph.emplace("q", NodeOp::Quantize(p), &ty).unwrap();
        let dq = graph
            .emplace("dq", NodeOp::Dequantize(p), &TensorType::u8([4]))
            .unwrap();
        graph
            .connect(InputId::new(q, 0), OutputId::new(x, 0))
            .unwrap();
        graph
            .connect(InputId::new(dq, 0), OutputId::new(q, 0))
            .unwrap();
        graph.add_output("y", OutputId::new(dq, 0)).unwrap();

        let values = Array::from_vec(vec![-1.0, 0.0, 0.3, 1.0]).into_dyn();
        let out = Evaluator::run(&graph, &inputs("x", values)).unwrap();
        assert_eq!(out["y"].as_slice().unwrap(), &[-1.0, 0.0, 0.25, 1.0]);
    }
}
