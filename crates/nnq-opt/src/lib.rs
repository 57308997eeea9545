//! Graph transforms lowering floating-point operators to fixed-point ones.
//!
//! Two kinds of passes live here:
//!
//! - whole-graph [`Pass`]es ([`MarkQuantizeRegion`], [`DeadNodeElimination`]),
//! - pattern [`Transform`]s driven node by node by the [`TransformEngine`],
//!   such as [`QuantizedConv2dTransform`].
//!
//! [`lower_to_fixed_point`] runs the standard pipeline.

mod checkpoints;
mod config;
mod dce;
pub mod quantized_conv2d;
pub mod quantizer;

pub use checkpoints::MarkQuantizeRegion;
pub use config::QuantConfig;
pub use dce::DeadNodeElimination;
pub use quantized_conv2d::{QuantizedBias, QuantizedConv2dTransform, QuantizedWeights};
pub use quantizer::{QuantizeError, Quantizer};

use std::fmt::Debug;

use nnq_ir::{Graph, InputId, IrError, NodeId, OpKind, OutputId};

/// A pass that inspects or rewrites a whole graph.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a graph. Returns `true` if anything was modified.
    fn run(&self, graph: &mut Graph) -> bool;
}

/// Errors raised while rewriting a graph.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// Deriving quantization parameters for a node failed.
    #[error("cannot quantize node '{node}': {source}")]
    Quantize {
        node: String,
        #[source]
        source: QuantizeError,
    },

    #[error(transparent)]
    Ir(#[from] IrError),

    /// A rewrite was handed a context its matcher would not have produced.
    #[error("transform '{transform}' got an invalid match: {reason}")]
    PatternMismatch {
        transform: String,
        reason: &'static str,
    },
}

/// What a successful match captured for the following rewrite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformContext {
    /// Nodes the pattern matched, root first.
    pub matched_nodes: Vec<NodeId>,
    /// External input connectors the pattern consumes.
    pub inputs: Vec<InputId>,
    /// Output connectors whose consumers must be moved by the rewrite.
    pub outputs: Vec<OutputId>,
}

/// A local graph rewrite rooted at a single node.
///
/// The engine offers candidate nodes to [`on_try_match`](Self::on_try_match),
/// which only reads the graph. On a match, [`process`](Self::process)
/// receives the captured context and mutates the graph.
pub trait Transform: Debug {
    /// Human-readable name of the transform.
    fn name(&self) -> &str;

    /// Operator kinds this transform wants to be offered.
    fn ops(&self) -> &[OpKind];

    /// Decide whether `node` roots this transform's pattern. On `true`, the
    /// captured connectors and nodes are left in `ctx`.
    fn on_try_match(&self, graph: &Graph, node: NodeId, ctx: &mut TransformContext) -> bool;

    /// Rewrite the matched pattern.
    fn process(&mut self, graph: &mut Graph, ctx: &TransformContext)
    -> Result<(), TransformError>;
}

/// Registered transforms, looked up by operator kind.
#[derive(Debug, Default)]
pub struct TransformRegistry<'a> {
    transforms: Vec<Box<dyn Transform + 'a>>,
}

impl<'a> TransformRegistry<'a> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    /// Registers a transform. Transforms are tried in registration order.
    pub fn register(&mut self, transform: Box<dyn Transform + 'a>) {
        self.transforms.push(transform);
    }

    /// Transforms registered for `kind`, in registration order.
    pub fn find(&mut self, kind: OpKind) -> impl Iterator<Item = &mut (dyn Transform + 'a)> {
        self.transforms
            .iter_mut()
            .filter(move |t| t.ops().contains(&kind))
            .map(|t| &mut **t)
    }

    /// Names of all registered transforms.
    pub fn names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

/// A rewrite performed by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rewrite {
    pub transform: String,
    pub node: String,
}

/// Summary of a [`TransformEngine::run`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformReport {
    /// Rewrites in the order they were applied.
    pub rewrites: Vec<Rewrite>,
    /// Nodes offered to at least the lookup step.
    pub visited: usize,
    /// Visited nodes no transform matched.
    pub not_matched: usize,
}

/// Drives registered transforms over a graph.
#[derive(Debug)]
pub struct TransformEngine;

impl TransformEngine {
    /// Offer every node live at the start of the run to the transforms
    /// registered for its operator kind.
    ///
    /// The first transform that matches a node rewrites it. Nodes created by
    /// a rewrite are not offered, so each original node is rewritten at most
    /// once. The first error aborts the run.
    pub fn run(
        graph: &mut Graph,
        registry: &mut TransformRegistry<'_>,
    ) -> Result<TransformReport, TransformError> {
        let snapshot: Vec<NodeId> = graph.nodes().map(|(id, _)| id).collect();
        let mut report = TransformReport::default();

        for id in snapshot {
            // An earlier rewrite may have removed it.
            let Ok(node) = graph.node(id) else {
                continue;
            };
            let kind = node.kind();
            report.visited += 1;

            let mut rewritten = false;
            for transform in registry.find(kind) {
                let mut ctx = TransformContext::default();
                if !transform.on_try_match(graph, id, &mut ctx) {
                    continue;
                }
                let name = graph[id].name().to_string();
                log::debug!("{}: matched {id} '{name}'", transform.name());
                transform.process(graph, &ctx)?;
                report.rewrites.push(Rewrite {
                    transform: transform.name().to_string(),
                    node: name,
                });
                rewritten = true;
                break;
            }
            if !rewritten {
                report.not_matched += 1;
            }
        }

        log::info!(
            "transform engine: {} nodes visited, {} rewritten, {} not matched",
            report.visited,
            report.rewrites.len(),
            report.not_matched
        );
        Ok(report)
    }
}

/// Carry the properties of `old` over to its replacement `new`.
///
/// The attribute flags of `old` are merged into `new`, and when a quantizer
/// is given, `new` inherits the calibration range of `old`.
pub fn link(
    graph: &mut Graph,
    old: OutputId,
    new: OutputId,
    quantizer: Option<&mut Quantizer>,
) -> Result<(), TransformError> {
    let attributes = graph.output(old)?.attributes;
    graph.output_mut(new)?.attributes |= attributes;
    if let Some(quantizer) = quantizer {
        quantizer
            .link(old, new)
            .map_err(|source| TransformError::Quantize {
                node: graph[old.node].name().to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Lower every flagged floating-point convolution to fixed point and drop
/// the nodes the rewrites left unreachable.
pub fn lower_to_fixed_point(
    graph: &mut Graph,
    quantizer: &mut Quantizer,
    config: QuantConfig,
) -> Result<TransformReport, TransformError> {
    let mut registry = TransformRegistry::new();
    registry.register(Box::new(QuantizedConv2dTransform::new(quantizer, config)));
    let report = TransformEngine::run(graph, &mut registry)?;
    DeadNodeElimination.run(graph);
    Ok(report)
}
