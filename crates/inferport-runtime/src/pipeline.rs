//! The build → optimize → bind → execute sequence for one network.
//!
//! A [`Pipeline`] owns its runtime, its graph and the loaded network. Every
//! step checks the current [`PipelineState`]; a failing step moves the
//! pipeline to `Failed`, which is terminal.

use std::fmt;

use inferport_core::{
    check_bindings, optimize_and_load, resolve_bindings, BackendPreference, BindingPointInfo,
    Error, Graph, IOName, InputBinding, ModelArtifact, ModelParser, NetworkId, OutputBinding,
    Result, Runtime,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Unbuilt,
    Built,
    Optimized,
    Bound,
    Executed,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Unbuilt => "unbuilt",
            PipelineState::Built => "built",
            PipelineState::Optimized => "optimized",
            PipelineState::Bound => "bound",
            PipelineState::Executed => "executed",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which endpoints a pipeline binds and which backends it may use.
///
/// An empty `inputs` or `outputs` list selects every endpoint of that kind
/// the graph declares. A non-empty `inputs` list must still name every graph
/// input; `outputs` may pick a subset, and the rest are computed but not
/// written.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub backends: BackendPreference,
    #[serde(default)]
    pub inputs: Vec<IOName>,
    #[serde(default)]
    pub outputs: Vec<IOName>,
}

impl PipelineConfig {
    pub fn new(backends: BackendPreference) -> Self {
        Self {
            backends,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<IOName>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<IOName>) -> Self {
        self.outputs.push(name.into());
        self
    }
}

/// Validated input and output buffers for exactly one [`Pipeline::execute`].
#[derive(Debug)]
pub struct BoundIo<'io> {
    inputs: Vec<InputBinding<'io>>,
    outputs: Vec<OutputBinding<'io>>,
}

pub struct Pipeline<R: Runtime> {
    runtime: R,
    config: PipelineConfig,
    state: PipelineState,
    graph: Option<Graph>,
    network: Option<NetworkId>,
    inputs: Vec<BindingPointInfo>,
    outputs: Vec<BindingPointInfo>,
}

impl<R: Runtime> Pipeline<R> {
    pub fn new(runtime: R, config: PipelineConfig) -> Self {
        Self {
            runtime,
            config,
            state: PipelineState::Unbuilt,
            graph: None,
            network: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn network(&self) -> Option<NetworkId> {
        self.network
    }

    /// `Unbuilt → Built`: takes ownership of an explicitly assembled graph.
    ///
    /// The graph must validate and declare every configured endpoint.
    pub fn build(&mut self, graph: Graph) -> Result<()> {
        self.require(PipelineState::Unbuilt, "build")?;
        let result = self.install_graph(graph);
        self.settle(result, PipelineState::Built)
    }

    /// `Unbuilt → Built` from a serialized model.
    pub fn build_from_model(
        &mut self,
        parser: &dyn ModelParser,
        artifact: &ModelArtifact,
    ) -> Result<()> {
        self.require(PipelineState::Unbuilt, "build")?;
        debug!(parser = parser.name(), "parsing model");
        let result = parser
            .parse_artifact(artifact)
            .and_then(|graph| self.install_graph(graph));
        self.settle(result, PipelineState::Built)
    }

    fn install_graph(&mut self, graph: Graph) -> Result<()> {
        graph.validate()?;
        if self.config.inputs.is_empty() {
            self.config.inputs = graph.input_names();
        } else if let Some(unfed) = graph
            .input_names()
            .into_iter()
            .find(|name| !self.config.inputs.contains(name))
        {
            return Err(Error::constraint(format!(
                "input '{unfed}' is not in the pipeline configuration"
            )));
        }
        if self.config.outputs.is_empty() {
            self.config.outputs = graph.output_names();
        }
        self.inputs = self
            .config
            .inputs
            .iter()
            .map(|n| graph.input_binding_info(n.as_str()))
            .collect::<Result<_>>()?;
        self.outputs = self
            .config
            .outputs
            .iter()
            .map(|n| graph.output_binding_info(n.as_str()))
            .collect::<Result<_>>()?;
        self.graph = Some(graph);
        Ok(())
    }

    /// `Built → Optimized`: plans the graph onto the configured backends, loads
    /// it and replaces the declared endpoint descriptors with the resolved ones.
    pub fn optimize(&mut self) -> Result<()> {
        self.require(PipelineState::Built, "optimize")?;
        let result = self.optimize_inner();
        self.settle(result, PipelineState::Optimized)
    }

    fn optimize_inner(&mut self) -> Result<()> {
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| Error::constraint("pipeline has no graph"))?;
        let network = optimize_and_load(&mut self.runtime, graph, &self.config.backends)?;
        self.network = Some(network);
        self.inputs = resolve_bindings(&self.runtime, network, &self.config.inputs)?;
        self.outputs = resolve_bindings(&self.runtime, network, &self.config.outputs)?;
        Ok(())
    }

    /// Descriptors to size buffers with. Before optimization these are the
    /// build-time declarations, afterwards the runtime's resolved ones.
    pub fn input_infos(&self) -> &[BindingPointInfo] {
        &self.inputs
    }

    pub fn output_infos(&self) -> &[BindingPointInfo] {
        &self.outputs
    }

    pub fn input_info(&self, name: &str) -> Result<&BindingPointInfo> {
        find_info(&self.inputs, "input", name)
    }

    pub fn output_info(&self, name: &str) -> Result<&BindingPointInfo> {
        find_info(&self.outputs, "output", name)
    }

    /// `Optimized → Bound`: checks that every configured endpoint has exactly
    /// one buffer matching its resolved descriptor.
    pub fn bind<'io>(
        &mut self,
        inputs: Vec<InputBinding<'io>>,
        outputs: Vec<OutputBinding<'io>>,
    ) -> Result<BoundIo<'io>> {
        self.require(PipelineState::Optimized, "bind")?;
        let result = check_bindings(&self.inputs, inputs.iter().map(|b| (b.name(), b.desc())))
            .and_then(|()| {
                check_bindings(&self.outputs, outputs.iter().map(|b| (b.name(), b.desc())))
            })
            .map(|()| BoundIo { inputs, outputs });
        self.settle(result, PipelineState::Bound)
    }

    /// `Bound → Executed`: one blocking run. `io` is consumed, so the output
    /// buffers are free to read as soon as this returns `Ok`.
    pub fn execute(&mut self, mut io: BoundIo<'_>) -> Result<()> {
        self.require(PipelineState::Bound, "execute")?;
        let result = match self.network {
            Some(network) => self.runtime.execute(network, &io.inputs, &mut io.outputs),
            None => Err(Error::constraint("pipeline has no loaded network")),
        };
        self.settle(result, PipelineState::Executed)
    }

    fn require(&self, expected: PipelineState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                state: self.state.as_str(),
                operation,
            })
        }
    }

    fn settle<T>(&mut self, result: Result<T>, next: PipelineState) -> Result<T> {
        let from = self.state;
        match result {
            Ok(value) => {
                self.state = next;
                info!(from = %from, to = %next, "pipeline step complete");
                Ok(value)
            }
            Err(err) => {
                self.state = PipelineState::Failed;
                warn!(from = %from, error = %err, "pipeline failed");
                Err(err)
            }
        }
    }
}

fn find_info<'a>(
    infos: &'a [BindingPointInfo],
    kind: &'static str,
    name: &str,
) -> Result<&'a BindingPointInfo> {
    infos
        .iter()
        .find(|info| info.name.as_str() == name)
        .ok_or_else(|| Error::not_found(kind, name))
}

impl<R: Runtime> Drop for Pipeline<R> {
    fn drop(&mut self) {
        if let Some(network) = self.network.take() {
            if let Err(err) = self.runtime.unload(network) {
                warn!(network = network.0, error = %err, "failed to unload network");
            }
        }
    }
}
