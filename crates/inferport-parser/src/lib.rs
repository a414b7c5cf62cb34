mod schema;

use inferport_core::{
    ActivationFunction, ConstTensor, DType, Element, Error, Graph, LayerKind, ModelParser,
    OutputSlot, Result, Shape, TensorDescriptor,
};
use tracing::debug;

use crate::schema::{ModelDoc, NodeDoc, OpDoc};

/// Parses a JSON graph description: a `nodes` array where each node has an
/// `op` tag, a unique `name`, its producers in `inputs` and the descriptor of
/// its output (`shape`, `dtype`, `quantization`).
///
/// Nodes are added first and connected in a second pass, so a node may
/// reference producers declared after it. Shapes left out of the document
/// stay unset and surface as a constraint violation when the graph is
/// validated.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonModelParser;

impl JsonModelParser {
    pub fn new() -> Self {
        Self
    }
}

impl ModelParser for JsonModelParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn parse(&self, bytes: &[u8]) -> Result<Graph> {
        let doc: ModelDoc = serde_json::from_slice(bytes)
            .map_err(|e| Error::format(format!("invalid model description: {e}")))?;

        let mut graph = Graph::new();
        let mut ids = Vec::with_capacity(doc.nodes.len());
        for node in &doc.nodes {
            let kind = layer_kind(node)?;
            let id = match kind {
                LayerKind::Input => graph.add_input(&node.name)?,
                LayerKind::Output => graph.add_output(&node.name)?,
                LayerKind::Constant(value) => graph.add_constant(&node.name, value)?,
                kind => graph.add_layer(&node.name, kind)?,
            };
            ids.push(id);
        }

        for (node, &id) in doc.nodes.iter().zip(&ids) {
            for (index, producer) in node.inputs.iter().enumerate() {
                let from = producer_slot(&graph, &node.name, producer)?;
                graph.connect(from, id.input(index))?;
            }
            // constants carry their own descriptor, outputs have no output slot
            if matches!(node.op, OpDoc::Output | OpDoc::Constant { .. }) {
                continue;
            }
            if let Some(desc) = descriptor(node) {
                graph.set_tensor_info(id.output(0), desc)?;
            }
        }

        debug!(nodes = graph.len(), "model parsed");
        Ok(graph)
    }
}

fn descriptor(node: &NodeDoc) -> Option<TensorDescriptor> {
    let shape = node.shape.as_deref()?;
    let desc = TensorDescriptor::new(shape, node.dtype);
    Some(match node.quantization {
        Some(q) => desc.with_quantization(q.scale, q.zero_point),
        None => desc,
    })
}

fn layer_kind(node: &NodeDoc) -> Result<LayerKind> {
    let kind = match &node.op {
        OpDoc::Input => LayerKind::Input,
        OpDoc::Output => LayerKind::Output,
        OpDoc::Constant { values } => {
            let desc = descriptor(node).ok_or_else(|| {
                Error::format(format!("constant '{}' has no shape", node.name))
            })?;
            LayerKind::Constant(constant(&node.name, desc, values)?)
        }
        OpDoc::FullyConnected {
            transpose_weights,
            bias_enabled,
        } => LayerKind::FullyConnected {
            transpose_weights: *transpose_weights,
            bias_enabled: *bias_enabled,
        },
        OpDoc::Addition => LayerKind::Addition,
        OpDoc::Multiplication => LayerKind::Multiplication,
        OpDoc::Relu => LayerKind::Activation(ActivationFunction::ReLu),
        OpDoc::BoundedRelu { upper, lower } => {
            LayerKind::Activation(ActivationFunction::BoundedReLu {
                upper: *upper,
                lower: *lower,
            })
        }
        OpDoc::Sigmoid => LayerKind::Activation(ActivationFunction::Sigmoid),
        OpDoc::Tanh => LayerKind::Activation(ActivationFunction::TanH),
        OpDoc::Linear { a, b } => LayerKind::Activation(ActivationFunction::Linear { a: *a, b: *b }),
        OpDoc::Softmax { beta } => LayerKind::Softmax { beta: *beta },
        OpDoc::Reshape => {
            let shape = node.shape.as_deref().ok_or_else(|| {
                Error::format(format!("reshape '{}' has no target shape", node.name))
            })?;
            LayerKind::Reshape {
                shape: Shape::from_slice(shape),
            }
        }
    };
    Ok(kind)
}

fn constant(name: &str, desc: TensorDescriptor, values: &[f64]) -> Result<ConstTensor> {
    match desc.dtype {
        DType::F32 => {
            let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            ConstTensor::new(desc, &values)
        }
        DType::I32 => ConstTensor::new(desc, &integers::<i32>(name, values)?),
        DType::I64 => ConstTensor::new(desc, &integers::<i64>(name, values)?),
        DType::U8 => ConstTensor::new(desc, &integers::<u8>(name, values)?),
    }
}

fn integers<T: Element + TryFrom<i64>>(name: &str, values: &[f64]) -> Result<Vec<T>> {
    values
        .iter()
        .map(|&v| {
            let exact = (v.fract() == 0.0).then_some(v as i64);
            exact.and_then(|i| T::try_from(i).ok()).ok_or_else(|| {
                Error::format(format!(
                    "constant '{name}' value {v} does not fit {:?}",
                    T::DTYPE
                ))
            })
        })
        .collect()
}

/// Resolves `node` or `node:slot`.
fn producer_slot(graph: &Graph, consumer: &str, producer: &str) -> Result<OutputSlot> {
    let (name, index) = match producer.rsplit_once(':') {
        Some((name, slot)) => {
            let index = slot.parse::<usize>().map_err(|_| {
                Error::format(format!("'{consumer}' has malformed input '{producer}'"))
            })?;
            (name, index)
        }
        None => (producer, 0),
    };
    let id = graph
        .node_id(name)
        .ok_or_else(|| Error::format(format!("'{consumer}' consumes unknown node '{name}'")))?;
    Ok(id.output(index))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const IDENTITY: &str = r#"{
        "nodes": [
            { "op": "output", "name": "output", "inputs": ["fc"] },
            { "op": "input", "name": "input", "shape": [1, 1] },
            { "op": "constant", "name": "weights", "shape": [1, 1], "values": [1.0] },
            { "op": "fully_connected", "name": "fc", "inputs": ["input", "weights:0"], "shape": [1, 1] }
        ]
    }"#;

    #[test]
    fn parses_forward_references() {
        let graph = JsonModelParser::new().parse(IDENTITY.as_bytes()).unwrap();
        assert_eq!(graph.len(), 4);
        graph.validate().unwrap();
        let out = graph.output_binding_info("output").unwrap();
        assert_eq!(out.desc.shape.dims(), &[1, 1]);
    }

    #[rstest]
    #[case::not_json("nodes")]
    #[case::unknown_op(r#"{"nodes":[{"op":"conv","name":"c"}]}"#)]
    #[case::unknown_producer(r#"{"nodes":[{"op":"output","name":"y","inputs":["x"]}]}"#)]
    #[case::bad_slot(r#"{"nodes":[{"op":"input","name":"x","shape":[1]},{"op":"output","name":"y","inputs":["x:a"]}]}"#)]
    #[case::constant_without_shape(r#"{"nodes":[{"op":"constant","name":"w","values":[1]}]}"#)]
    #[case::fractional_integer(r#"{"nodes":[{"op":"constant","name":"w","shape":[1],"dtype":"i32","values":[1.5]}]}"#)]
    fn malformed_documents_are_format_errors(#[case] doc: &str) {
        let err = JsonModelParser::new().parse(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err}");
    }

    #[test]
    fn missing_shape_is_left_for_validation() {
        let doc = r#"{"nodes":[
            {"op":"input","name":"x"},
            {"op":"output","name":"y","inputs":["x"]}
        ]}"#;
        let graph = JsonModelParser::new().parse(doc.as_bytes()).unwrap();
        assert!(matches!(graph.validate(), Err(Error::Constraint(_))));
    }

    #[test]
    fn quantized_constants_keep_their_parameters() {
        let doc = r#"{"nodes":[
            {"op":"constant","name":"w","shape":[2],"dtype":"u8",
             "quantization":{"scale":0.5,"zero_point":10},"values":[10, 14]}
        ]}"#;
        let graph = JsonModelParser::new().parse(doc.as_bytes()).unwrap();
        let w = graph.node_id("w").unwrap();
        let desc = graph.tensor_info(w.output(0)).unwrap();
        assert_eq!(desc.dtype, DType::U8);
        assert!(desc.is_constant);
        assert_eq!(desc.quantization.map(|q| q.zero_point), Some(10));
    }
}
