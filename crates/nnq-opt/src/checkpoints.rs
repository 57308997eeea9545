//! Marks the tensors around selected operators for quantization.
//!
//! Calibration must record a range for every connector this pass flags.

use nnq_ir::{Attributes, Graph, NodeId, OpKind, OutputId};

use crate::Pass;

/// Flags the inputs and outputs of every node of the selected kinds with
/// [`Attributes::NEEDS_QUANTIZE`].
#[derive(Debug)]
pub struct MarkQuantizeRegion {
    kinds: Vec<OpKind>,
}

impl Default for MarkQuantizeRegion {
    fn default() -> Self {
        Self::new(vec![OpKind::Conv2d])
    }
}

impl MarkQuantizeRegion {
    pub fn new(kinds: Vec<OpKind>) -> Self {
        Self { kinds }
    }

    /// Output connectors the pass would flag, in node order.
    pub fn targets(&self, graph: &Graph) -> Vec<OutputId> {
        let mut targets = Vec::new();
        for (id, node) in graph.nodes() {
            if !self.kinds.contains(&node.kind()) {
                continue;
            }
            for input in node.inputs() {
                match input.connection() {
                    Some(src) => targets.push(src),
                    None => log::warn!("{} '{}' has an unconnected input", node.kind(), node.name()),
                }
            }
            targets.extend((0..node.outputs().len() as u32).map(|i| OutputId::new(id, i)));
        }
        targets
    }
}

impl Pass for MarkQuantizeRegion {
    fn name(&self) -> &str {
        "mark-quantize-region"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;
        for target in self.targets(graph) {
            if let Ok(out) = graph.output_mut(target)
                && !out.attributes.contains(Attributes::NEEDS_QUANTIZE)
            {
                out.attributes.insert(Attributes::NEEDS_QUANTIZE);
                changed = true;
            }
        }

        let nodes: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, n)| self.kinds.contains(&n.kind()))
            .map(|(id, _)| id)
            .collect();
        for id in nodes {
            if let Ok(node) = graph.node_mut(id)
                && !node.attributes.contains(Attributes::NEEDS_QUANTIZE)
            {
                node.attributes.insert(Attributes::NEEDS_QUANTIZE);
                changed = true;
            }
        }

        if changed {
            log::debug!("{}: flagged region around {:?}", self.name(), self.kinds);
        }
        changed
    }
}
