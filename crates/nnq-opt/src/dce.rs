//! Dead node elimination.
//!
//! Removes nodes whose results can no longer reach a graph output, such as
//! the floating-point operators a lowering rewrite replaced.

use nnq_ir::{Graph, NodeId, OpKind};

use crate::Pass;

/// Removes nodes unreachable from the designated graph outputs.
///
/// Graph inputs are kept even when nothing consumes them.
#[derive(Debug)]
pub struct DeadNodeElimination;

impl DeadNodeElimination {
    /// Remove every dead node and return how many were removed.
    pub fn eliminate(&self, graph: &mut Graph) -> usize {
        let live = graph.reachable();
        let dead: Vec<NodeId> = graph
            .nodes()
            .filter(|(id, n)| !live.contains(id) && n.kind() != OpKind::Input)
            .map(|(id, _)| id)
            .collect();

        let mut removed = 0;
        for id in dead {
            match graph.remove_node(id) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("dce: keeping {id}: {e}"),
            }
        }
        if removed > 0 {
            log::debug!("dce: removed {removed} nodes");
        }
        removed
    }
}

impl Pass for DeadNodeElimination {
    fn name(&self) -> &str {
        "dce"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        self.eliminate(graph) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array4};
    use nnq_ir::{Conv2d, InputId, NodeOp, OutputId, TensorType};

    fn conv_op() -> NodeOp {
        NodeOp::Conv2d(Conv2d::new(Array4::zeros((1, 1, 1, 1)), Array1::zeros(1)))
    }

    #[test]
    fn removes_dangling_chain() {
        let ty = TensorType::f32([1, 1, 2, 2]);
        let mut graph = Graph::new();
        let x = graph.add_input("x", ty.clone());
        let a = graph.emplace("a", conv_op(), &ty).unwrap();
        let b = graph.emplace("b", conv_op(), &ty).unwrap();
        graph.connect(InputId::new(a, 0), OutputId::new(x, 0)).unwrap();
        graph.connect(InputId::new(b, 0), OutputId::new(a, 0)).unwrap();
        graph.add_output("y", OutputId::new(x, 0)).unwrap();

        assert_eq!(DeadNodeElimination.eliminate(&mut graph), 2);
        assert!(!graph.contains(a));
        assert!(!graph.contains(b));
        // The input's fan-out no longer refers to the removed conv.
        assert_eq!(graph.consumers(OutputId::new(x, 0)).unwrap().len(), 1);
    }

    #[test]
    fn keeps_unused_inputs() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", TensorType::f32([1]));
        let unused = graph.add_input("unused", TensorType::f32([1]));
        graph.add_output("y", OutputId::new(x, 0)).unwrap();
        assert!(!DeadNodeElimination.run(&mut graph));
        assert!(graph.contains(unused));
    }
}
