//! Serde shape of the JSON model description.
//!
//! ```json
//! { "nodes": [
//!     { "op": "input", "name": "x", "shape": [1, 4] },
//!     { "op": "constant", "name": "w", "shape": [4, 2], "values": [...] },
//!     { "op": "fully_connected", "name": "fc", "inputs": ["x", "w"], "shape": [1, 2] },
//!     { "op": "output", "name": "y", "inputs": ["fc:0"] }
//! ] }
//! ```

use inferport_core::{DType, QuantizationInfo};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct ModelDoc {
    pub nodes: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NodeDoc {
    pub name: String,
    #[serde(flatten)]
    pub op: OpDoc,
    /// Producers, as `node` or `node:slot`.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub shape: Option<Vec<usize>>,
    #[serde(default = "default_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub quantization: Option<QuantizationInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum OpDoc {
    Input,
    Output,
    Constant {
        values: Vec<f64>,
    },
    FullyConnected {
        #[serde(default)]
        transpose_weights: bool,
        #[serde(default)]
        bias_enabled: bool,
    },
    Addition,
    Multiplication,
    Relu,
    BoundedRelu {
        upper: f32,
        #[serde(default)]
        lower: f32,
    },
    Sigmoid,
    Tanh,
    Linear {
        a: f32,
        #[serde(default)]
        b: f32,
    },
    Softmax {
        #[serde(default = "default_beta")]
        beta: f32,
    },
    /// Target shape is the node's own `shape`.
    Reshape,
}

fn default_dtype() -> DType {
    DType::F32
}

fn default_beta() -> f32 {
    1.0
}
