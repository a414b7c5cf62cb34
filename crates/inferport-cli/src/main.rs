mod cli;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{BackendArgs, Cli, Command};
use inferport_core::{
    BackendPreference, ConstTensor, DType, Graph, InputBinding, LayerKind, ModelArtifact,
    OutputBinding, TensorDescriptor,
};
use inferport_data::IdxDataset;
use inferport_parser::JsonModelParser;
use inferport_runtime::{LocalRuntime, Pipeline, PipelineConfig, RuntimeOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid --log filter")?)
        .init();

    match cli.command {
        Command::Identity { value, backend } => identity(value, backend),
        Command::Classify {
            model,
            images,
            labels,
            index,
            no_scale,
            config,
            backend,
        } => {
            let dataset = IdxDataset::new(images, labels, !no_scale);
            classify(model, dataset, index, config, backend)
        }
    }
}

fn runtime(args: &BackendArgs) -> LocalRuntime {
    LocalRuntime::new(RuntimeOptions {
        max_resident_bytes: args.max_resident_bytes,
    })
}

fn preference(args: &BackendArgs) -> Result<BackendPreference> {
    args.backends
        .parse::<BackendPreference>()
        .context("invalid --backends")
}

/// input [1, 1] -> fully connected (weight 1.0) -> output
fn identity_graph() -> Result<Graph> {
    let scalar = TensorDescriptor::new([1, 1], DType::F32);
    let mut g = Graph::new();
    let input = g.add_input("input")?;
    let weights = g.add_constant("weights", ConstTensor::new(scalar.clone(), &[1.0f32])?)?;
    let fc = g.add_layer(
        "fc",
        LayerKind::FullyConnected {
            transpose_weights: false,
            bias_enabled: false,
        },
    )?;
    let output = g.add_output("output")?;
    g.connect(input.output(0), fc.input(0))?;
    g.connect(weights.output(0), fc.input(1))?;
    g.connect(fc.output(0), output.input(0))?;
    g.set_tensor_info(input.output(0), scalar.clone())?;
    g.set_tensor_info(fc.output(0), scalar)?;
    Ok(g)
}

fn identity(value: f32, args: BackendArgs) -> Result<()> {
    let mut pipeline = Pipeline::new(runtime(&args), PipelineConfig::new(preference(&args)?));
    pipeline.build(identity_graph()?)?;
    pipeline.optimize()?;

    let in_desc = pipeline.input_info("input")?.desc.clone();
    let out_desc = pipeline.output_info("output")?.desc.clone();
    let input = [value];
    let mut output = [0.0f32];
    let io = pipeline.bind(
        vec![InputBinding::new("input", &in_desc, &input)?],
        vec![OutputBinding::new("output", &out_desc, &mut output)?],
    )?;
    pipeline.execute(io)?;

    println!("{}", output[0]);
    Ok(())
}

fn classify(
    model: PathBuf,
    dataset: IdxDataset,
    index: usize,
    config: Option<PathBuf>,
    args: BackendArgs,
) -> Result<()> {
    let config = match config {
        Some(path) => {
            let raw = std::fs::read(&path)
                .with_context(|| format!("reading pipeline config {}", path.display()))?;
            serde_json::from_slice::<PipelineConfig>(&raw)
                .with_context(|| format!("parsing pipeline config {}", path.display()))?
        }
        None => PipelineConfig::new(preference(&args)?),
    };
    let mut pipeline = Pipeline::new(runtime(&args), config);

    let started = Instant::now();
    pipeline
        .build_from_model(&JsonModelParser::new(), &ModelArtifact::Path(model.clone()))
        .with_context(|| format!("building {}", model.display()))?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "model parsed");

    let started = Instant::now();
    pipeline.optimize().context("optimizing and loading")?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "network loaded");

    let sample = dataset
        .read_sample(index)
        .with_context(|| format!("reading sample {index}"))?;

    let input = pipeline
        .input_infos()
        .first()
        .context("model declares no inputs")?
        .clone();
    let output = pipeline
        .output_infos()
        .first()
        .context("model declares no outputs")?
        .clone();
    let mut scores = vec![0.0f32; output.desc.num_elements()];

    let started = Instant::now();
    let io = pipeline.bind(
        vec![InputBinding::new(
            input.name.clone(),
            &input.desc,
            &sample.features,
        )?],
        vec![OutputBinding::new(
            output.name.clone(),
            &output.desc,
            &mut scores,
        )?],
    )?;
    pipeline.execute(io)?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "inference done");

    let predicted = scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(class, _)| class)
        .context("model produced no scores")?;
    println!("predicted {predicted} (label {})", sample.label);
    Ok(())
}
