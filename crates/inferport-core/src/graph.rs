//! In-memory computation graph.
//!
//! Nodes are added one at a time and return a [`NodeId`] that stays valid for
//! the lifetime of the graph. Edges run from an [`OutputSlot`] to an
//! [`InputSlot`]; an output slot may feed any number of inputs, an input slot
//! accepts exactly one producer.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::{
    BindingPointInfo, ConstTensor, EndpointKind, Error, IOName, Result, Shape, TensorDescriptor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
    pub fn output(self, index: usize) -> OutputSlot {
        OutputSlot { node: self, index }
    }
    pub fn input(self, index: usize) -> InputSlot {
        InputSlot { node: self, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputSlot {
    pub node: NodeId,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputSlot {
    pub node: NodeId,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ActivationFunction {
    ReLu,
    /// Clamps to `[lower, upper]`.
    BoundedReLu { upper: f32, lower: f32 },
    Sigmoid,
    TanH,
    /// `a * x + b`
    Linear { a: f32, b: f32 },
}

#[derive(Clone, Debug)]
pub enum LayerKind {
    Input,
    Output,
    Constant(ConstTensor),
    /// Inputs: data `[N, K..]`, weights `[K, M]` (`[M, K]` when transposed), optional bias `[M]`.
    FullyConnected {
        transpose_weights: bool,
        bias_enabled: bool,
    },
    Addition,
    Multiplication,
    Activation(ActivationFunction),
    /// Softmax over the last axis.
    Softmax { beta: f32 },
    Reshape { shape: Shape },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input => "Input",
            LayerKind::Output => "Output",
            LayerKind::Constant(_) => "Constant",
            LayerKind::FullyConnected { .. } => "FullyConnected",
            LayerKind::Addition => "Addition",
            LayerKind::Multiplication => "Multiplication",
            LayerKind::Activation(_) => "Activation",
            LayerKind::Softmax { .. } => "Softmax",
            LayerKind::Reshape { .. } => "Reshape",
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            LayerKind::Input | LayerKind::Constant(_) => 0,
            LayerKind::Output
            | LayerKind::Activation(_)
            | LayerKind::Softmax { .. }
            | LayerKind::Reshape { .. } => 1,
            LayerKind::Addition | LayerKind::Multiplication => 2,
            LayerKind::FullyConnected { bias_enabled, .. } => {
                if *bias_enabled {
                    3
                } else {
                    2
                }
            }
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            LayerKind::Output => 0,
            _ => 1,
        }
    }

    /// Endpoints and constants move data; everything else computes.
    pub fn is_compute(&self) -> bool {
        !matches!(
            self,
            LayerKind::Input | LayerKind::Output | LayerKind::Constant(_)
        )
    }

    /// Shape produced on output slot 0 given the descriptors feeding the inputs.
    pub fn infer_output_shape(&self, inputs: &[&TensorDescriptor]) -> Result<Shape> {
        if inputs.len() != self.num_inputs() {
            return Err(Error::constraint(format!(
                "{} expects {} inputs, got {}",
                self.name(),
                self.num_inputs(),
                inputs.len()
            )));
        }
        match self {
            LayerKind::Input | LayerKind::Output => Err(Error::constraint(format!(
                "{} layers have no inferable output",
                self.name()
            ))),
            LayerKind::Constant(c) => Ok(c.desc().shape.clone()),
            LayerKind::FullyConnected {
                transpose_weights,
                bias_enabled,
            } => {
                let (batch, k) = fc_input_dims(&inputs[0].shape);
                let w = inputs[1].shape.dims();
                if w.len() != 2 {
                    return Err(Error::constraint(format!(
                        "FullyConnected weights must be rank 2, got {}",
                        inputs[1].shape
                    )));
                }
                let (wk, m) = if *transpose_weights {
                    (w[1], w[0])
                } else {
                    (w[0], w[1])
                };
                if wk != k {
                    return Err(Error::constraint(format!(
                        "FullyConnected input {} has {k} features but weights {} expect {wk}",
                        inputs[0].shape, inputs[1].shape
                    )));
                }
                if *bias_enabled && inputs[2].num_elements() != m {
                    return Err(Error::constraint(format!(
                        "FullyConnected bias {} does not match {m} outputs",
                        inputs[2].shape
                    )));
                }
                Ok(Shape::from([batch, m]))
            }
            LayerKind::Addition | LayerKind::Multiplication => {
                broadcast_shapes(&inputs[0].shape, &inputs[1].shape).ok_or_else(|| {
                    Error::constraint(format!(
                        "{} operands {} and {} are not broadcastable",
                        self.name(),
                        inputs[0].shape,
                        inputs[1].shape
                    ))
                })
            }
            LayerKind::Activation(_) | LayerKind::Softmax { .. } => Ok(inputs[0].shape.clone()),
            LayerKind::Reshape { shape } => {
                if shape.numel() != inputs[0].num_elements() {
                    return Err(Error::constraint(format!(
                        "cannot reshape {} into {shape}",
                        inputs[0].shape
                    )));
                }
                Ok(shape.clone())
            }
        }
    }
}

/// Splits a fully-connected input into `(batch, features)`.
pub fn fc_input_dims(shape: &Shape) -> (usize, usize) {
    match shape.dims() {
        [k] => (1, *k),
        [n, ..] if *n > 0 => (*n, shape.numel() / n),
        _ => (1, shape.numel()),
    }
}

/// Numpy-style broadcast of two shapes, aligned on the trailing dimension.
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Option<Shape> {
    let rank = a.rank().max(b.rank());
    let mut out = vec![0usize; rank];
    for (i, slot) in out.iter_mut().enumerate() {
        let da = dim_from_back(a, rank - 1 - i);
        let db = dim_from_back(b, rank - 1 - i);
        *slot = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(Shape::from_slice(&out))
}

fn dim_from_back(shape: &Shape, from_back: usize) -> usize {
    let dims = shape.dims();
    if from_back < dims.len() {
        dims[dims.len() - 1 - from_back]
    } else {
        1
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    kind: LayerKind,
    inputs: Vec<Option<OutputSlot>>,
    outputs: Vec<Option<TensorDescriptor>>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }
    /// Producer feeding each input slot, `None` while unconnected.
    pub fn inputs(&self) -> &[Option<OutputSlot>] {
        &self.inputs
    }
    /// Tensor info of each output slot, `None` while unset.
    pub fn outputs(&self) -> &[Option<TensorDescriptor>] {
        &self.outputs
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind.name(), self.name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_input(&mut self, name: &str) -> Result<NodeId> {
        self.add_layer(name, LayerKind::Input)
    }

    pub fn add_output(&mut self, name: &str) -> Result<NodeId> {
        self.add_layer(name, LayerKind::Output)
    }

    /// Adds a constant whose output slot is already described by the tensor.
    pub fn add_constant(&mut self, name: &str, tensor: ConstTensor) -> Result<NodeId> {
        self.add_layer(name, LayerKind::Constant(tensor))
    }

    pub fn add_layer(&mut self, name: &str, kind: LayerKind) -> Result<NodeId> {
        if self.names.contains_key(name) {
            return Err(Error::constraint(format!(
                "a layer named '{name}' already exists"
            )));
        }
        let fixed_shape = match &kind {
            LayerKind::Constant(c) => Some(&c.desc().shape),
            LayerKind::Reshape { shape } => Some(shape),
            _ => None,
        };
        if let Some(shape) = fixed_shape.filter(|shape| !shape.is_valid()) {
            return Err(Error::constraint(format!(
                "{} '{name}' has shape {shape}, dimensions must be positive",
                kind.name()
            )));
        }
        let mut outputs = vec![None; kind.num_outputs()];
        if let LayerKind::Constant(c) = &kind {
            outputs[0] = Some(c.desc().clone());
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            inputs: vec![None; kind.num_inputs()],
            outputs,
            kind,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn connect(&mut self, from: OutputSlot, to: InputSlot) -> Result<()> {
        let producer = self.node_checked(from.node)?;
        if from.index >= producer.outputs.len() {
            return Err(Error::constraint(format!(
                "{producer} has no output slot {}",
                from.index
            )));
        }
        if from.node == to.node {
            return Err(Error::constraint(format!(
                "{producer} cannot feed itself"
            )));
        }
        let consumer = self.node_checked(to.node)?;
        match consumer.inputs.get(to.index) {
            None => Err(Error::constraint(format!(
                "{consumer} has no input slot {}",
                to.index
            ))),
            Some(Some(_)) => Err(Error::constraint(format!(
                "input slot {} of {consumer} is already connected",
                to.index
            ))),
            Some(None) => {
                self.nodes[to.node.0].inputs[to.index] = Some(from);
                Ok(())
            }
        }
    }

    pub fn set_tensor_info(&mut self, slot: OutputSlot, desc: TensorDescriptor) -> Result<()> {
        let node = self.node_checked(slot.node)?;
        if slot.index >= node.outputs.len() {
            return Err(Error::constraint(format!(
                "{node} has no output slot {}",
                slot.index
            )));
        }
        if !desc.shape.is_valid() {
            return Err(Error::constraint(format!(
                "shape {} for {node} must have positive dimensions",
                desc.shape
            )));
        }
        if let LayerKind::Constant(c) = &node.kind {
            if !c.desc().is_compatible_with(&desc) {
                return Err(Error::constraint(format!(
                    "{node} holds a {} tensor, cannot describe it as {}",
                    c.desc().shape,
                    desc.shape
                )));
            }
        }
        self.nodes[slot.node.0].outputs[slot.index] = Some(desc);
        Ok(())
    }

    /// Fails with [`Error::Constraint`] while the slot's shape is unset.
    pub fn tensor_info(&self, slot: OutputSlot) -> Result<&TensorDescriptor> {
        let node = self.node_checked(slot.node)?;
        match node.outputs.get(slot.index) {
            Some(Some(desc)) => Ok(desc),
            Some(None) => Err(Error::constraint(format!(
                "output slot {} of {node} has no tensor info",
                slot.index
            ))),
            None => Err(Error::constraint(format!(
                "{node} has no output slot {}",
                slot.index
            ))),
        }
    }

    /// Unchecked lookup for ids this graph handed out itself.
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Fails with [`Error::NotFound`] for an id this graph never issued.
    pub fn node_checked(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::not_found("node", format!("#{}", id.0)))
    }

    /// Input slots fed by `slot`, in node order.
    pub fn consumers(&self, slot: OutputSlot) -> Vec<InputSlot> {
        self.nodes()
            .flat_map(|(id, node)| {
                node.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, src)| **src == Some(slot))
                    .map(move |(i, _)| id.input(i))
            })
            .collect()
    }

    pub fn input_names(&self) -> Vec<IOName> {
        self.endpoint_names(EndpointKind::Input)
    }

    pub fn output_names(&self) -> Vec<IOName> {
        self.endpoint_names(EndpointKind::Output)
    }

    fn endpoint_names(&self, kind: EndpointKind) -> Vec<IOName> {
        self.nodes
            .iter()
            .filter(|n| endpoint_kind(&n.kind) == Some(kind))
            .map(|n| IOName(n.name.clone()))
            .collect()
    }

    /// Resolves a declared input or output endpoint by name.
    pub fn declared_endpoint(&self, name: &str) -> Result<BindingPointInfo> {
        let id = self
            .node_id(name)
            .filter(|id| endpoint_kind(&self.node(*id).kind).is_some())
            .ok_or_else(|| Error::not_found("endpoint", name))?;
        self.binding_info(id)
    }

    pub fn input_binding_info(&self, name: &str) -> Result<BindingPointInfo> {
        self.endpoint_of_kind(name, EndpointKind::Input)
    }

    pub fn output_binding_info(&self, name: &str) -> Result<BindingPointInfo> {
        self.endpoint_of_kind(name, EndpointKind::Output)
    }

    fn endpoint_of_kind(&self, name: &str, kind: EndpointKind) -> Result<BindingPointInfo> {
        let id = self
            .node_id(name)
            .filter(|id| endpoint_kind(&self.node(*id).kind) == Some(kind))
            .ok_or_else(|| Error::not_found(kind.as_str(), name))?;
        self.binding_info(id)
    }

    fn binding_info(&self, id: NodeId) -> Result<BindingPointInfo> {
        let node = self.node(id);
        let (kind, desc) = match node.kind {
            LayerKind::Input => (EndpointKind::Input, self.tensor_info(id.output(0))?),
            _ => {
                let src = node.inputs[0].ok_or_else(|| {
                    Error::constraint(format!("{node} is not connected to a producer"))
                })?;
                (EndpointKind::Output, self.tensor_info(src)?)
            }
        };
        Ok(BindingPointInfo {
            name: IOName(node.name.clone()),
            kind,
            desc: desc.clone(),
        })
    }

    /// Checks the build-time invariants: every input slot connected, every
    /// output slot described, at least one output endpoint.
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.iter().any(|n| matches!(n.kind, LayerKind::Output)) {
            return Err(Error::constraint("graph has no output layers"));
        }
        for node in &self.nodes {
            if let Some(i) = node.inputs.iter().position(Option::is_none) {
                return Err(Error::constraint(format!(
                    "input slot {i} of {node} is not connected"
                )));
            }
            if let Some(i) = node.outputs.iter().position(Option::is_none) {
                return Err(Error::constraint(format!(
                    "output slot {i} of {node} has no tensor info"
                )));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; ties are broken by insertion order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.inputs.iter().flatten().count())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for src in node.inputs.iter().flatten() {
                dependents[src.node.0].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(NodeId(i));
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::constraint("graph contains a cycle"));
        }
        Ok(order)
    }
}

fn endpoint_kind(kind: &LayerKind) -> Option<EndpointKind> {
    match kind {
        LayerKind::Input => Some(EndpointKind::Input),
        LayerKind::Output => Some(EndpointKind::Output),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::DType;

    fn f32_desc(dims: &[usize]) -> TensorDescriptor {
        TensorDescriptor::new(dims, DType::F32)
    }

    fn identity_graph() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let weights = ConstTensor::new(f32_desc(&[1, 1]), &[1.0f32]).unwrap();
        let w = g.add_constant("const weights", weights).unwrap();
        let fc = g
            .add_layer(
                "fully connected",
                LayerKind::FullyConnected {
                    transpose_weights: false,
                    bias_enabled: false,
                },
            )
            .unwrap();
        let input = g.add_input("input").unwrap();
        let output = g.add_output("output").unwrap();
        g.connect(input.output(0), fc.input(0)).unwrap();
        g.connect(w.output(0), fc.input(1)).unwrap();
        g.connect(fc.output(0), output.input(0)).unwrap();
        (g, input, fc, output)
    }

    #[test]
    fn connecting_occupied_slot_fails() {
        let (mut g, input, fc, _) = identity_graph();
        let err = g.connect(input.output(0), fc.input(0)).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut g = Graph::new();
        g.add_input("x").unwrap();
        assert!(matches!(g.add_output("x"), Err(Error::Constraint(_))));
    }

    #[rstest]
    #[case::zero_dim(&[0], &[])]
    #[case::scalar(&[], &[1.0])]
    fn constants_need_positive_dimensions(#[case] dims: &[usize], #[case] values: &[f32]) {
        let tensor = ConstTensor::new(f32_desc(dims), values).unwrap();
        let mut g = Graph::new();
        let err = g.add_constant("w", tensor).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)), "{err}");
        assert!(g.is_empty());
    }

    #[test]
    fn reshape_target_needs_positive_dimensions() {
        let mut g = Graph::new();
        let err = g
            .add_layer(
                "flat",
                LayerKind::Reshape {
                    shape: Shape::from([4, 0]),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)), "{err}");
    }

    #[test]
    fn foreign_node_id_is_not_found() {
        let (g, ..) = identity_graph();
        let mut other = Graph::new();
        for i in 0..g.len() + 1 {
            other.add_input(&format!("x{i}")).unwrap();
        }
        let foreign = other.node_id(&format!("x{}", g.len())).unwrap();
        assert!(matches!(
            g.node_checked(foreign),
            Err(Error::NotFound { kind: "node", .. })
        ));
        let input = g.node_id("input").unwrap();
        assert_eq!(g.node_checked(input).unwrap().name(), "input");
    }

    #[test]
    fn unset_shape_is_a_constraint_error() {
        let (g, input, _, _) = identity_graph();
        assert!(matches!(
            g.tensor_info(input.output(0)),
            Err(Error::Constraint(_))
        ));
        assert!(matches!(g.validate(), Err(Error::Constraint(_))));
        assert!(matches!(
            g.input_binding_info("input"),
            Err(Error::Constraint(_))
        ));
    }

    #[test]
    fn validated_graph_resolves_endpoints() {
        let (mut g, input, fc, _) = identity_graph();
        g.set_tensor_info(input.output(0), f32_desc(&[1, 1])).unwrap();
        g.set_tensor_info(fc.output(0), f32_desc(&[1, 1])).unwrap();
        g.validate().unwrap();

        let info = g.output_binding_info("output").unwrap();
        assert_eq!(info.kind, EndpointKind::Output);
        assert_eq!(info.desc.shape, Shape::from([1, 1]));
        assert!(matches!(
            g.input_binding_info("output"),
            Err(Error::NotFound { kind: "input", .. })
        ));
        assert!(matches!(
            g.declared_endpoint("fully connected"),
            Err(Error::NotFound { .. })
        ));
        assert_eq!(g.input_names(), vec![IOName::from("input")]);
    }

    #[test]
    fn unconnected_input_fails_validation() {
        let mut g = Graph::new();
        let relu = g
            .add_layer("relu", LayerKind::Activation(ActivationFunction::ReLu))
            .unwrap();
        let out = g.add_output("out").unwrap();
        g.set_tensor_info(relu.output(0), f32_desc(&[4])).unwrap();
        g.connect(relu.output(0), out.input(0)).unwrap();
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("input slot 0"), "{err}");
    }

    #[test]
    fn topological_order_puts_producers_first() {
        let (g, input, fc, output) = identity_graph();
        let order = g.topological_order().unwrap();
        let pos = |id: NodeId| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(input) < pos(fc));
        assert!(pos(fc) < pos(output));
    }

    #[test]
    fn cycles_are_detected() {
        let mut g = Graph::new();
        let a = g
            .add_layer("a", LayerKind::Activation(ActivationFunction::ReLu))
            .unwrap();
        let b = g
            .add_layer("b", LayerKind::Activation(ActivationFunction::Sigmoid))
            .unwrap();
        g.connect(a.output(0), b.input(0)).unwrap();
        g.connect(b.output(0), a.input(0)).unwrap();
        assert!(matches!(g.topological_order(), Err(Error::Constraint(_))));
    }

    #[test]
    fn fully_connected_shape_inference() {
        let fc = LayerKind::FullyConnected {
            transpose_weights: true,
            bias_enabled: true,
        };
        let input = f32_desc(&[2, 1, 28, 28]);
        let weights = f32_desc(&[10, 784]);
        let bias = f32_desc(&[10]);
        let shape = fc
            .infer_output_shape(&[&input, &weights, &bias])
            .unwrap();
        assert_eq!(shape, Shape::from([2, 10]));

        let bad = f32_desc(&[784, 10]);
        assert!(fc.infer_output_shape(&[&input, &bad, &bias]).is_err());
    }

    #[test]
    fn broadcasting_follows_trailing_dims() {
        let a = Shape::from([2, 3]);
        assert_eq!(
            broadcast_shapes(&a, &Shape::from([3])),
            Some(Shape::from([2, 3]))
        );
        assert_eq!(
            broadcast_shapes(&a, &Shape::from([2, 1])),
            Some(Shape::from([2, 3]))
        );
        assert_eq!(broadcast_shapes(&a, &Shape::from([2])), None);
    }
}
