use std::sync::Arc;

use anyhow::Result;
use inferport_backend_ref::RefBackend;
use inferport_core::{
    Backend, BackendCapabilities, BackendId, BackendPreference, Error, InputBinding, LayerKind,
    MemorySpace, ModelArtifact, OutputBinding, TensorDescriptor, TensorRef,
};
use inferport_parser::JsonModelParser;
use inferport_runtime::{LocalRuntime, Pipeline, PipelineConfig, PipelineState, RuntimeOptions};

/// Device-memory backend that only runs fully connected layers, delegating
/// the arithmetic to the reference kernels.
struct FcOnlyDevice {
    host_io: bool,
}

impl Backend for FcOnlyDevice {
    fn id(&self) -> BackendId {
        BackendId::GPU_ACC
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            memory: MemorySpace::Device(0),
            host_import: self.host_io,
            host_export: self.host_io,
        }
    }

    fn check_support(
        &self,
        layer: &LayerKind,
        _inputs: &[&TensorDescriptor],
        _output: &TensorDescriptor,
    ) -> std::result::Result<(), String> {
        match layer {
            LayerKind::FullyConnected { .. } => Ok(()),
            other => Err(format!("{} is not implemented", other.name())),
        }
    }

    fn execute(
        &self,
        layer: &LayerKind,
        inputs: &[TensorRef<'_>],
        output: &mut [f32],
        output_desc: &TensorDescriptor,
    ) -> inferport_core::Result<()> {
        RefBackend::new().execute(layer, inputs, output, output_desc)
    }
}

/// x[1,3] -> fc(w[3,2], b[2]) -> relu -> softmax -> y[1,2]
const CLASSIFIER: &str = r#"{
    "nodes": [
        { "op": "input", "name": "x", "shape": [1, 3] },
        { "op": "constant", "name": "w", "shape": [3, 2], "values": [1, 0, 0, 1, 1, -1] },
        { "op": "constant", "name": "b", "shape": [2], "values": [0.5, 0] },
        { "op": "fully_connected", "name": "fc", "inputs": ["x", "w", "b"],
          "bias_enabled": true, "shape": [1, 2] },
        { "op": "relu", "name": "relu", "inputs": ["fc"], "shape": [1, 2] },
        { "op": "softmax", "name": "probs", "inputs": ["relu"], "shape": [1, 2] },
        { "op": "output", "name": "y", "inputs": ["probs"] }
    ]
}"#;

fn run_classifier(runtime: LocalRuntime, backends: BackendPreference) -> Result<Vec<f32>> {
    let mut p = Pipeline::new(runtime, PipelineConfig::new(backends));
    p.build_from_model(
        &JsonModelParser::new(),
        &ModelArtifact::Bytes(CLASSIFIER.as_bytes().to_vec().into()),
    )?;
    p.optimize()?;

    let x = p.input_info("x")?.desc.clone();
    let y = p.output_info("y")?.desc.clone();
    let data = [1.0f32, 2.0, 3.0];
    let mut probs = vec![0.0f32; y.num_elements()];
    let io = p.bind(
        vec![InputBinding::new("x", &x, &data)?],
        vec![OutputBinding::new("y", &y, &mut probs)?],
    )?;
    p.execute(io)?;
    assert_eq!(p.state(), PipelineState::Executed);
    Ok(probs)
}

#[test]
fn parsed_model_runs_on_reference_backend() -> Result<()> {
    let probs = run_classifier(
        LocalRuntime::new(RuntimeOptions::default()),
        BackendPreference::new([BackendId::CPU_REF]),
    )?;
    // fc = [1 + 3 + 0.5, 2 - 3] = [4.5, -1], relu -> [4.5, 0]
    let expected_0 = 1.0 / (1.0 + (-4.5f32).exp());
    assert!((probs[0] - expected_0).abs() < 1e-6, "{probs:?}");
    assert!((probs[0] + probs[1] - 1.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn split_across_memory_spaces_gives_the_same_result() -> Result<()> {
    let reference = run_classifier(
        LocalRuntime::new(RuntimeOptions::default()),
        BackendPreference::new([BackendId::CPU_REF]),
    )?;
    let device: Vec<Arc<dyn Backend>> = vec![
        Arc::new(FcOnlyDevice { host_io: true }),
        Arc::new(RefBackend::new()),
    ];
    let split = run_classifier(
        LocalRuntime::with_backends(RuntimeOptions::default(), device),
        BackendPreference::with_fallback(),
    )?;
    assert_eq!(reference, split);
    Ok(())
}

#[test]
fn caller_can_retry_with_a_narrower_preference() -> Result<()> {
    let device = || -> Vec<Arc<dyn Backend>> {
        vec![
            Arc::new(FcOnlyDevice { host_io: false }),
            Arc::new(RefBackend::new()),
        ]
    };

    let err = run_classifier(
        LocalRuntime::with_backends(RuntimeOptions::default(), device()),
        BackendPreference::new([BackendId::GPU_ACC]),
    )
    .unwrap_err();
    let err = err.downcast::<Error>()?;
    assert!(err.is_retryable_with_other_backends());
    assert!(err.to_string().contains("GpuAcc"), "{err}");

    let probs = run_classifier(
        LocalRuntime::with_backends(RuntimeOptions::default(), device()),
        BackendPreference::new([BackendId::CPU_REF]),
    )?;
    assert_eq!(probs.len(), 2);
    Ok(())
}

#[test]
fn missing_model_file_is_an_io_error() {
    let mut p = Pipeline::new(
        LocalRuntime::new(RuntimeOptions::default()),
        PipelineConfig::default(),
    );
    let err = p
        .build_from_model(
            &JsonModelParser::new(),
            &ModelArtifact::Path("does/not/exist.json".into()),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }), "{err}");
    assert_eq!(p.state(), PipelineState::Failed);
}

#[test]
fn wrong_length_buffer_never_reaches_the_runtime() -> Result<()> {
    let mut p = Pipeline::new(
        LocalRuntime::new(RuntimeOptions::default()),
        PipelineConfig::default(),
    );
    p.build_from_model(
        &JsonModelParser::new(),
        &ModelArtifact::Bytes(CLASSIFIER.as_bytes().to_vec().into()),
    )?;
    p.optimize()?;
    let x = p.input_info("x")?.desc.clone();
    let short = [1.0f32, 2.0];
    let err = InputBinding::new("x", &x, &short).unwrap_err();
    assert!(matches!(
        err,
        Error::SizeMismatch {
            expected: 3,
            got: 2,
            ..
        }
    ));
    assert_eq!(p.state(), PipelineState::Optimized);
    Ok(())
}
