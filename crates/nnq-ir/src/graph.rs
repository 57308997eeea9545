//! Dataflow graph of operator nodes joined through typed connectors.
//!
//! Nodes live in an [`Arena`] and are addressed by [`NodeId`]. Connectors
//! are addressed by `(node, index)` pairs ([`InputId`], [`OutputId`]), and an
//! edge is recorded on both ends: the consuming input stores its producer and
//! the producing output stores its consumers. Every mutation keeps the two
//! ends in agreement.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::Index;

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::ops::{NodeOp, OpKind, Signature};
use crate::types::{Attributes, TensorType};

/// Identifier of a node in a [`Graph`].
pub type NodeId = Handle<Node>;

/// Identifies an input connector: the `index`-th input of `node`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InputId {
    pub node: NodeId,
    pub index: u32,
}

impl InputId {
    pub fn new(node: NodeId, index: u32) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.in{}", self.node, self.index)
    }
}

/// Identifies an output connector: the `index`-th output of `node`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct OutputId {
    pub node: NodeId,
    pub index: u32,
}

impl OutputId {
    pub fn new(node: NodeId, index: u32) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.out{}", self.node, self.index)
    }
}

/// A typed tensor slot consuming the value of at most one output.
#[derive(Clone, Debug)]
pub struct InputConnector {
    ty: TensorType,
    connection: Option<OutputId>,
}

impl InputConnector {
    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    /// The output feeding this input, if connected.
    pub fn connection(&self) -> Option<OutputId> {
        self.connection
    }
}

/// A typed tensor slot produced by a node, feeding any number of inputs.
#[derive(Clone, Debug)]
pub struct OutputConnector {
    ty: TensorType,
    /// Flags describing the tensor this connector produces.
    pub attributes: Attributes,
    connections: Vec<InputId>,
}

impl OutputConnector {
    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    /// Consumers of this output, in connection order.
    pub fn connections(&self) -> &[InputId] {
        &self.connections
    }
}

/// A node in the graph.
#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    op: NodeOp,
    /// Flags describing the node.
    pub attributes: Attributes,
    inputs: Vec<InputConnector>,
    outputs: Vec<OutputConnector>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn inputs(&self) -> &[InputConnector] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputConnector] {
        &self.outputs
    }
}

/// An operator graph with designated input and output nodes.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Arena<Node>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node for `op` fed with a tensor of type `ty` and return its id.
    ///
    /// The node's connectors are derived from the op's signature and start
    /// out unconnected. `Input` and `Output` nodes are designated as graph
    /// inputs and outputs.
    pub fn emplace(
        &mut self,
        name: impl Into<String>,
        op: NodeOp,
        ty: &TensorType,
    ) -> Result<NodeId, IrError> {
        let sig = op.signature(ty)?;
        Ok(self.append_node(name.into(), op, sig))
    }

    /// Add a graph input producing tensors of type `ty`.
    pub fn add_input(&mut self, name: impl Into<String>, ty: TensorType) -> NodeId {
        let sig = Signature {
            inputs: vec![],
            outputs: vec![ty],
        };
        self.append_node(name.into(), NodeOp::Input, sig)
    }

    fn append_node(&mut self, name: String, op: NodeOp, sig: Signature) -> NodeId {
        let kind = op.kind();
        let id = self.nodes.append(Node {
            name,
            op,
            attributes: Attributes::EMPTY,
            inputs: sig
                .inputs
                .into_iter()
                .map(|ty| InputConnector {
                    ty,
                    connection: None,
                })
                .collect(),
            outputs: sig
                .outputs
                .into_iter()
                .map(|ty| OutputConnector {
                    ty,
                    attributes: Attributes::EMPTY,
                    connections: Vec::new(),
                })
                .collect(),
        });
        match kind {
            OpKind::Input => self.inputs.push(id),
            OpKind::Output => self.outputs.push(id),
            _ => {}
        }
        id
    }

    /// Add a graph output consuming `source`.
    pub fn add_output(
        &mut self,
        name: impl Into<String>,
        source: OutputId,
    ) -> Result<NodeId, IrError> {
        let ty = self.output(source)?.ty.clone();
        let id = self.emplace(name, NodeOp::Output, &ty)?;
        self.connect(InputId::new(id, 0), source)?;
        Ok(id)
    }

    /// Look up a live node.
    pub fn node(&self, id: NodeId) -> Result<&Node, IrError> {
        self.nodes.try_get(id).ok_or(IrError::BadHandle(id))
    }

    /// Look up a live node mutably. Connectivity stays private to the graph.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, IrError> {
        self.nodes.try_get_mut(id).ok_or(IrError::BadHandle(id))
    }

    /// Returns `true` if `id` refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn input(&self, id: InputId) -> Result<&InputConnector, IrError> {
        self.node(id.node)?
            .inputs
            .get(id.index as usize)
            .ok_or(IrError::BadConnector {
                node: id.node,
                direction: "input",
                index: id.index,
            })
    }

    pub fn output(&self, id: OutputId) -> Result<&OutputConnector, IrError> {
        self.node(id.node)?
            .outputs
            .get(id.index as usize)
            .ok_or(IrError::BadConnector {
                node: id.node,
                direction: "output",
                index: id.index,
            })
    }

    pub fn output_mut(&mut self, id: OutputId) -> Result<&mut OutputConnector, IrError> {
        self.node_mut(id.node)?
            .outputs
            .get_mut(id.index as usize)
            .ok_or(IrError::BadConnector {
                node: id.node,
                direction: "output",
                index: id.index,
            })
    }

    /// The output feeding `input`, if any.
    pub fn producer(&self, input: InputId) -> Result<Option<OutputId>, IrError> {
        Ok(self.input(input)?.connection)
    }

    /// The inputs fed by `output`, in connection order.
    pub fn consumers(&self, output: OutputId) -> Result<&[InputId], IrError> {
        Ok(&self.output(output)?.connections)
    }

    /// Connect `input` to `output`, replacing any previous producer of `input`.
    ///
    /// The connector types must match exactly.
    pub fn connect(&mut self, input: InputId, output: OutputId) -> Result<(), IrError> {
        let expected = &self.output(output)?.ty;
        let found = &self.input(input)?.ty;
        if expected != found {
            return Err(IrError::TypeMismatch {
                expected: format!("{expected}"),
                found: format!("{found}"),
            });
        }

        match self.input(input)?.connection {
            Some(previous) if previous == output => return Ok(()),
            Some(_) => {
                self.disconnect(input)?;
            }
            None => {}
        }

        self.output_mut(output)?.connections.push(input);
        self.nodes[input.node].inputs[input.index as usize].connection = Some(output);
        Ok(())
    }

    /// Detach `input` from its producer. Returns the former producer.
    pub fn disconnect(&mut self, input: InputId) -> Result<Option<OutputId>, IrError> {
        let Some(previous) = self.input(input)?.connection else {
            return Ok(None);
        };
        if let Ok(out) = self.output_mut(previous) {
            out.connections.retain(|&c| c != input);
        }
        self.nodes[input.node].inputs[input.index as usize].connection = None;
        Ok(Some(previous))
    }

    /// Logically remove a node, detaching every edge that touches it.
    ///
    /// The node's slot is never reused. Designated inputs and outputs are
    /// refused.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), IrError> {
        let node = self.node(id)?;
        if self.inputs.contains(&id) || self.outputs.contains(&id) {
            return Err(IrError::DesignatedNode(node.name.clone()));
        }

        let input_count = node.inputs.len() as u32;
        let consumers: Vec<InputId> = node
            .outputs
            .iter()
            .flat_map(|o| o.connections.iter().copied())
            .collect();

        for index in 0..input_count {
            self.disconnect(InputId::new(id, index))?;
        }
        for consumer in consumers {
            self.disconnect(consumer)?;
        }
        self.nodes.remove(id);
        Ok(())
    }

    /// Iterates over live nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Designated graph input nodes.
    pub fn graph_inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Designated graph output nodes.
    pub fn graph_outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Find a live node by name. Returns the first match in creation order.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| id)
    }

    /// Nodes reachable from the designated outputs by walking producers.
    pub fn reachable(&self) -> HashSet<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut worklist: Vec<NodeId> = self
            .outputs
            .iter()
            .copied()
            .filter(|&id| self.contains(id))
            .collect();
        while let Some(id) = worklist.pop() {
            if !seen.insert(id) {
                continue;
            }
            for input in &self.nodes[id].inputs {
                if let Some(src) = input.connection {
                    worklist.push(src.node);
                }
            }
        }
        seen
    }

    /// Returns the nodes reachable from the outputs in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IrError> {
        let reachable = self.reachable();

        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut ready: BTreeSet<NodeId> = BTreeSet::new();
        for &id in &reachable {
            let degree = self.nodes[id]
                .inputs
                .iter()
                .filter(|i| i.connection.is_some())
                .count();
            in_degree.insert(id, degree);
            if degree == 0 {
                ready.insert(id);
            }
        }

        let mut result = Vec::with_capacity(reachable.len());
        while let Some(id) = ready.pop_first() {
            result.push(id);
            for output in &self.nodes[id].outputs {
                for consumer in &output.connections {
                    if let Some(deg) = in_degree.get_mut(&consumer.node) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(consumer.node);
                        }
                    }
                }
            }
        }

        if result.len() != reachable.len() {
            return Err(IrError::Cycle {
                visited: result.len(),
                total: reachable.len(),
            });
        }
        Ok(result)
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}
