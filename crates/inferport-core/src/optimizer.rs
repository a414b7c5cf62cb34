//! Turns a [`Graph`] into an [`OptimizedNetwork`]: a flat list of steps in
//! execution order where every compute layer is pinned to one backend.
//!
//! Passes, in order: validation, topological sort, identity-reshape elision,
//! shape checking, backend assignment, copy insertion. The caller's graph is
//! only read.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    Backend, BackendCapabilities, BackendId, BackendPreference, ConstTensor, DeviceSpec, Error,
    Graph, IOName, LayerKind, MemorySpace, Node, NodeId, OutputSlot, Result, TensorDescriptor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Where a tensor lives once produced.
#[derive(Clone, Debug)]
struct Placement {
    backend: Option<BackendId>,
    caps: BackendCapabilities,
}

impl Placement {
    fn host() -> Self {
        Self {
            backend: None,
            caps: BackendCapabilities::HOST,
        }
    }

    fn label(&self) -> &str {
        self.backend.as_ref().map_or("host", |b| b.as_str())
    }
}

#[derive(Clone)]
pub enum Step {
    /// Stage the caller's input buffer into `tensor`.
    Input { name: IOName, tensor: TensorId },
    Constant {
        name: String,
        tensor: TensorId,
        value: ConstTensor,
    },
    Compute {
        name: String,
        kind: LayerKind,
        inputs: Vec<TensorId>,
        output: TensorId,
        backend: Arc<dyn Backend>,
    },
    /// Move a tensor between memory spaces.
    Copy {
        src: TensorId,
        dst: TensorId,
        from: MemorySpace,
        to: MemorySpace,
    },
    /// Hand `tensor` back through the caller's output buffer.
    Output { name: IOName, tensor: TensorId },
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Input { name, tensor } => write!(f, "Input({name} -> {})", tensor.0),
            Step::Constant { name, tensor, .. } => write!(f, "Constant({name} -> {})", tensor.0),
            Step::Compute {
                name,
                kind,
                inputs,
                output,
                backend,
            } => write!(
                f,
                "{}({name} {:?} -> {} on {})",
                kind.name(),
                inputs.iter().map(|t| t.0).collect::<Vec<_>>(),
                output.0,
                backend.id()
            ),
            Step::Copy { src, dst, from, to } => {
                write!(f, "Copy({} {from:?} -> {} {to:?})", src.0, dst.0)
            }
            Step::Output { name, tensor } => write!(f, "Output({} -> {name})", tensor.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OptimizedNetwork {
    preference: Vec<BackendId>,
    tensors: Vec<TensorDescriptor>,
    steps: Vec<Step>,
    inputs: Vec<(IOName, TensorId)>,
    outputs: Vec<(IOName, TensorId)>,
}

impl OptimizedNetwork {
    /// The backend preference this network was optimized with.
    pub fn preference(&self) -> &[BackendId] {
        &self.preference
    }

    pub fn tensors(&self) -> &[TensorDescriptor] {
        &self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> &TensorDescriptor {
        &self.tensors[id.0]
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn inputs(&self) -> &[(IOName, TensorId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(IOName, TensorId)] {
        &self.outputs
    }

    /// Backend chosen for each compute layer, by layer name.
    pub fn assignments(&self) -> Vec<(&str, BackendId)> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                Step::Compute { name, backend, .. } => Some((name.as_str(), backend.id())),
                _ => None,
            })
            .collect()
    }

    pub fn copy_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Copy { .. }))
            .count()
    }

    /// Bytes needed to keep every tensor of the network resident at once.
    pub fn resident_bytes(&self) -> usize {
        self.tensors.iter().map(TensorDescriptor::num_bytes).sum()
    }
}

/// Plans `graph` onto the backends of `device`, trying `preference` in order
/// for every compute layer.
pub fn optimize(
    graph: &Graph,
    preference: &BackendPreference,
    device: &DeviceSpec,
) -> Result<OptimizedNetwork> {
    graph.validate()?;
    let order = graph.topological_order()?;
    let attempted = preference.ids().to_vec();

    let active: Vec<&Arc<dyn Backend>> = preference
        .ids()
        .iter()
        .filter_map(|id| device.backend(id))
        .collect();
    if active.is_empty() {
        return Err(Error::Optimization {
            backends: attempted,
            reason: format!(
                "none of the preferred backends are available (device offers [{}])",
                device
                    .supported_ids()
                    .iter()
                    .map(BackendId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });
    }

    let mut plan = Planner {
        graph,
        active,
        attempted,
        tensors: Vec::new(),
        placements: Vec::new(),
        slot_tensor: HashMap::new(),
        copies: HashMap::new(),
        steps: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
    };

    for id in order {
        let node = graph.node(id);
        match node.kind() {
            LayerKind::Input => {
                let tensor = plan.new_tensor(id.output(0), Placement::host())?;
                plan.tensors[tensor.0].is_constant = true;
                let name = IOName(node.name().to_string());
                plan.inputs.push((name.clone(), tensor));
                plan.steps.push(Step::Input { name, tensor });
            }
            LayerKind::Constant(value) => {
                let tensor = plan.new_tensor(id.output(0), Placement::host())?;
                plan.steps.push(Step::Constant {
                    name: node.name().to_string(),
                    tensor,
                    value: value.clone(),
                });
            }
            LayerKind::Output => {
                let src = plan.source_tensor(node.inputs()[0])?;
                let tensor = plan.stage(src, &Placement::host()).ok_or_else(|| {
                    Error::Optimization {
                        backends: plan.attempted.clone(),
                        reason: format!(
                            "result of Output '{}' is stuck on {}",
                            node.name(),
                            plan.placements[src.0].label()
                        ),
                    }
                })?;
                let name = IOName(node.name().to_string());
                plan.outputs.push((name.clone(), tensor));
                plan.steps.push(Step::Output { name, tensor });
            }
            LayerKind::Reshape { .. } if plan.is_identity_reshape(id.output(0))? => {
                let src = plan.source_tensor(node.inputs()[0])?;
                debug!(layer = node.name(), "eliding identity reshape");
                plan.slot_tensor.insert(id.output(0), src);
            }
            kind => plan.place_compute(id, kind)?,
        }
    }

    let network = OptimizedNetwork {
        preference: plan.attempted,
        tensors: plan.tensors,
        steps: plan.steps,
        inputs: plan.inputs,
        outputs: plan.outputs,
    };
    info!(
        steps = network.steps.len(),
        copies = network.copy_count(),
        "graph optimized"
    );
    Ok(network)
}

struct Planner<'g> {
    graph: &'g Graph,
    active: Vec<&'g Arc<dyn Backend>>,
    attempted: Vec<BackendId>,
    tensors: Vec<TensorDescriptor>,
    placements: Vec<Placement>,
    slot_tensor: HashMap<OutputSlot, TensorId>,
    copies: HashMap<(TensorId, MemorySpace), TensorId>,
    steps: Vec<Step>,
    inputs: Vec<(IOName, TensorId)>,
    outputs: Vec<(IOName, TensorId)>,
}

impl Planner<'_> {
    fn new_tensor(&mut self, slot: OutputSlot, placement: Placement) -> Result<TensorId> {
        let desc = self.graph.tensor_info(slot)?.clone();
        let id = TensorId(self.tensors.len());
        self.tensors.push(desc);
        self.placements.push(placement);
        self.slot_tensor.insert(slot, id);
        Ok(id)
    }

    fn source_tensor(&self, slot: Option<OutputSlot>) -> Result<TensorId> {
        slot.and_then(|s| self.slot_tensor.get(&s).copied())
            .ok_or_else(|| Error::constraint("layer input is not connected to a planned producer"))
    }

    /// A reshape whose declared output already matches its source. The
    /// declaration is checked against inference first, so a mislabelled
    /// reshape is rejected rather than dropped.
    fn is_identity_reshape(&self, out: OutputSlot) -> Result<bool> {
        let node = self.graph.node(out.node);
        let src = &self.tensors[self.source_tensor(node.inputs()[0])?.0];
        let declared = self.graph.tensor_info(out)?;
        check_declared_shape(node, &[src], declared)?;
        Ok(src.is_compatible_with(declared))
    }

    /// Returns a tensor holding `src` that `target` can read, inserting a copy
    /// step when memory spaces differ. `None` if no transfer path exists.
    fn stage(&mut self, src: TensorId, target: &Placement) -> Option<TensorId> {
        let from = self.placements[src.0].clone();
        if !target.caps.can_receive_from(&from.caps) {
            return None;
        }
        if from.caps.memory == target.caps.memory {
            return Some(src);
        }
        let key = (src, target.caps.memory);
        if let Some(&dst) = self.copies.get(&key) {
            return Some(dst);
        }
        let dst = TensorId(self.tensors.len());
        let mut desc = self.tensors[src.0].clone();
        desc.is_constant = false;
        self.tensors.push(desc);
        self.placements.push(target.clone());
        self.copies.insert(key, dst);
        debug!(
            tensor = src.0,
            from = from.label(),
            to = target.label(),
            "inserting memory copy"
        );
        self.steps.push(Step::Copy {
            src,
            dst,
            from: from.caps.memory,
            to: target.caps.memory,
        });
        Some(dst)
    }

    fn place_compute(&mut self, id: NodeId, kind: &LayerKind) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(id);
        let sources = node
            .inputs()
            .iter()
            .map(|s| self.source_tensor(*s))
            .collect::<Result<Vec<_>>>()?;
        let output_desc = graph.tensor_info(id.output(0))?;

        let input_descs: Vec<&TensorDescriptor> =
            sources.iter().map(|t| &self.tensors[t.0]).collect();
        check_declared_shape(node, &input_descs, output_desc)?;

        let mut rejections = Vec::new();
        let mut chosen = None;
        for backend in &self.active {
            let placement = Placement {
                backend: Some(backend.id()),
                caps: backend.capabilities(),
            };
            if let Err(reason) = backend.check_support(kind, &input_descs, output_desc) {
                rejections.push(format!("{}: {reason}", backend.id()));
                continue;
            }
            let unreachable = sources.iter().find(|t| {
                !placement
                    .caps
                    .can_receive_from(&self.placements[t.0].caps)
            });
            if let Some(t) = unreachable {
                rejections.push(format!(
                    "{}: cannot receive tensor from {}",
                    backend.id(),
                    self.placements[t.0].label()
                ));
                continue;
            }
            chosen = Some((Arc::clone(backend), placement));
            break;
        }

        let Some((backend, placement)) = chosen else {
            return Err(Error::Optimization {
                backends: self.attempted.clone(),
                reason: format!("no backend can run {node} ({})", rejections.join("; ")),
            });
        };
        debug!(layer = node.name(), backend = %backend.id(), "assigned layer");

        let mut inputs = Vec::with_capacity(sources.len());
        for src in sources {
            // reachability was checked above
            let staged = self.stage(src, &placement).ok_or_else(|| {
                Error::constraint(format!("lost transfer path while planning {node}"))
            })?;
            inputs.push(staged);
        }
        let output = self.new_tensor(id.output(0), placement)?;
        self.steps.push(Step::Compute {
            name: node.name().to_string(),
            kind: kind.clone(),
            inputs,
            output,
            backend,
        });
        Ok(())
    }
}

fn check_declared_shape(
    node: &Node,
    inputs: &[&TensorDescriptor],
    declared: &TensorDescriptor,
) -> Result<()> {
    let inferred = node.kind().infer_output_shape(inputs)?;
    if inferred != declared.shape {
        return Err(Error::constraint(format!(
            "{node} declares output shape {} but its inputs produce {inferred}",
            declared.shape
        )));
    }
    Ok(())
}
