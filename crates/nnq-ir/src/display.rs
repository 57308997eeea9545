//! Display implementations and text dump for debugging.

use std::fmt::{self, Write};

use crate::graph::{Graph, Node};
use crate::ops::{NodeOp, OpKind};
use crate::quant::{FixedMul, QuantParam, ValueRange};
use crate::types::{Attributes, Padding, Scalar, ScalarKind, Shape, TensorType};

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sint => write!(f, "sint"),
            Self::Uint => write!(f, "uint"),
            Self::Float => write!(f, "float"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Sint => write!(f, "i{}", self.width * 8),
            ScalarKind::Uint => write!(f, "u{}", self.width * 8),
            ScalarKind::Float => write!(f, "f{}", self.width * 8),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scalar, self.shape)
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Attributes::NEEDS_QUANTIZE) {
            write!(f, "needs_quantize")
        } else {
            write!(f, "none")
        }
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.before, self.after)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

impl fmt::Display for QuantParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scale={:.6}, zero_point={}", self.scale, self.zero_point)
    }
}

impl fmt::Display for FixedMul {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >> {}", self.mantissa, self.shift)
    }
}

fn write_op(out: &mut String, op: &NodeOp) -> fmt::Result {
    match op {
        NodeOp::Input | NodeOp::Output => write!(out, "{}", op.kind()),
        NodeOp::Conv2d(c) => write!(
            out,
            "conv2d(w={:?}, groups={}, pad={}/{}, stride={}x{}, dilation={}x{})",
            c.weights.dim(),
            c.groups,
            c.padding_h,
            c.padding_w,
            c.stride_h,
            c.stride_w,
            c.dilation_h,
            c.dilation_w
        ),
        NodeOp::QuantizedConv2d(c) => write!(
            out,
            "quantized_conv2d(w={:?}, groups={}, pad={}/{}, stride={}x{}, dilation={}x{}, \
             in_off={}, w_off={}, mul={} >> {}, out_off={})",
            c.weights.dim(),
            c.groups,
            c.padding_h,
            c.padding_w,
            c.stride_h,
            c.stride_w,
            c.dilation_h,
            c.dilation_w,
            c.input_offset,
            c.weight_offset,
            c.output_mul,
            c.output_shift,
            c.output_offset
        ),
        NodeOp::Quantize(qp) => write!(out, "quantize({qp})"),
        NodeOp::Dequantize(qp) => write!(out, "dequantize({qp})"),
    }
}

fn write_node(out: &mut String, graph: &Graph, id: crate::NodeId, node: &Node) -> fmt::Result {
    write!(out, "  {id} \"{}\" = ", node.name())?;
    write_op(out, node.op())?;

    let args: Vec<String> = node
        .inputs()
        .iter()
        .map(|i| match i.connection() {
            Some(src) => match graph.node(src.node) {
                Ok(p) => format!("{src} (\"{}\")", p.name()),
                Err(_) => format!("{src} (removed)"),
            },
            None => "<unconnected>".into(),
        })
        .collect();
    if !args.is_empty() {
        write!(out, " <- {}", args.join(", "))?;
    }

    for (i, o) in node.outputs().iter().enumerate() {
        write!(out, " -> out{i}: {}", o.ty())?;
        if !o.attributes.is_empty() {
            write!(out, " [{}]", o.attributes)?;
        }
    }
    writeln!(out)
}

/// Dump a graph to a human-readable string, one live node per line.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Graph ({} nodes):", graph.node_count());
    for (id, node) in graph.nodes() {
        let _ = write_node(&mut out, graph, id, node);
    }
    out
}
