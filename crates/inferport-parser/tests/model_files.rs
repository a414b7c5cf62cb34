use anyhow::Result;
use inferport_core::{Error, LayerKind, ModelArtifact, ModelParser};
use inferport_parser::JsonModelParser;

const MLP: &str = r#"{
    "nodes": [
        { "op": "input", "name": "pixels", "shape": [1, 2, 2] },
        { "op": "reshape", "name": "flat", "inputs": ["pixels"], "shape": [1, 4] },
        { "op": "constant", "name": "w", "shape": [2, 4], "values": [1, 1, 1, 1, 0, 0, 0, 1] },
        { "op": "fully_connected", "name": "fc", "inputs": ["flat", "w"],
          "transpose_weights": true, "shape": [1, 2] },
        { "op": "bounded_relu", "name": "clip", "inputs": ["fc"], "upper": 6, "shape": [1, 2] },
        { "op": "output", "name": "scores", "inputs": ["clip"] }
    ]
}"#;

#[test]
fn parses_a_model_from_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mlp.json");
    std::fs::write(&path, MLP)?;

    let graph = JsonModelParser::new().parse_artifact(&ModelArtifact::Path(path))?;
    graph.validate()?;
    assert_eq!(graph.input_names()[0].as_str(), "pixels");
    assert_eq!(graph.output_names()[0].as_str(), "scores");

    let fc = graph.node_checked(graph.node_id("fc").unwrap())?;
    assert!(matches!(
        fc.kind(),
        LayerKind::FullyConnected {
            transpose_weights: true,
            bias_enabled: false
        }
    ));
    let flat = graph.node_checked(graph.node_id("flat").unwrap())?;
    match flat.kind() {
        LayerKind::Reshape { shape } => assert_eq!(shape.dims(), &[1, 4]),
        other => panic!("unexpected layer {}", other.name()),
    }
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let err = JsonModelParser::new()
        .parse_artifact(&ModelArtifact::Path("no/such/model.json".into()))
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }), "{err}");
}

#[test]
fn duplicate_node_names_are_rejected() {
    let doc = r#"{"nodes":[
        {"op":"input","name":"x","shape":[1]},
        {"op":"input","name":"x","shape":[1]}
    ]}"#;
    let err = JsonModelParser::new().parse(doc.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Constraint(_)), "{err}");
}

#[test]
fn a_slot_can_only_be_fed_once() {
    // relu has a single input slot
    let doc = r#"{"nodes":[
        {"op":"input","name":"x","shape":[1]},
        {"op":"relu","name":"r","inputs":["x","x"],"shape":[1]}
    ]}"#;
    let err = JsonModelParser::new().parse(doc.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::Constraint(_)), "{err}");
}
