use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use inferport_backend_ref::RefBackend;
use inferport_core::{
    check_bindings, Backend, BackendId, BindingPointInfo, DeviceSpec, EndpointKind, Error,
    IOName, InputBinding, NetworkId, OptimizedNetwork, OutputBinding, Result, Runtime, Step,
    TensorId, TensorRef,
};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuntimeOptions {
    /// Upper bound on the bytes a single network may keep resident.
    #[serde(default)]
    pub max_resident_bytes: Option<usize>,
}

struct LoadedGraph {
    network: OptimizedNetwork,
    constants: HashMap<TensorId, Vec<f32>>,
}

/// Runtime that keeps every tensor in host memory and dispatches each
/// compute step to the backend the optimizer chose.
pub struct LocalRuntime {
    options: RuntimeOptions,
    backends: Vec<Arc<dyn Backend>>,
    networks: HashMap<NetworkId, LoadedGraph>,
    next_id: u32,
}

impl LocalRuntime {
    /// A runtime with only the reference backend registered.
    pub fn new(options: RuntimeOptions) -> Self {
        Self::with_backends(options, vec![Arc::new(RefBackend::new())])
    }

    pub fn with_backends(options: RuntimeOptions, backends: Vec<Arc<dyn Backend>>) -> Self {
        Self {
            options,
            backends,
            networks: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.networks.len()
    }

    fn loaded(&self, network: NetworkId) -> Result<&LoadedGraph> {
        self.networks
            .get(&network)
            .ok_or_else(|| Error::not_found("network", network.0.to_string()))
    }

    fn is_registered(&self, id: &BackendId) -> bool {
        self.backends.iter().any(|b| &b.id() == id)
    }
}

impl Runtime for LocalRuntime {
    fn device_spec(&self) -> DeviceSpec {
        DeviceSpec::new(self.backends.clone())
    }

    fn load(&mut self, network: OptimizedNetwork) -> Result<NetworkId> {
        let reject = |reason: String| Error::Load {
            backends: network.preference().to_vec(),
            reason,
        };

        let resident = network.resident_bytes();
        if let Some(limit) = self.options.max_resident_bytes {
            if resident > limit {
                return Err(reject(format!(
                    "network needs {resident} resident bytes, limit is {limit}"
                )));
            }
        }

        let mut constants = HashMap::new();
        for step in network.steps() {
            match step {
                Step::Compute { name, backend, .. } if !self.is_registered(&backend.id()) => {
                    return Err(reject(format!(
                        "layer '{name}' is assigned to {} which this runtime does not host",
                        backend.id()
                    )));
                }
                Step::Constant { name, tensor, value } => {
                    let values = value
                        .desc()
                        .decode_f32(value.bytes())
                        .map_err(|e| reject(format!("constant '{name}': {e}")))?;
                    constants.insert(*tensor, values);
                }
                _ => {}
            }
        }

        let id = NetworkId(self.next_id);
        self.next_id += 1;
        info!(
            network = id.0,
            steps = network.steps().len(),
            resident_bytes = resident,
            "network loaded"
        );
        self.networks.insert(id, LoadedGraph { network, constants });
        Ok(id)
    }

    fn endpoint_info(&self, network: NetworkId, name: &str) -> Result<BindingPointInfo> {
        let net = &self.loaded(network)?.network;
        let lookup = |list: &[(IOName, TensorId)], kind: EndpointKind| {
            list.iter()
                .find(|(n, _)| n.as_str() == name)
                .map(|(n, t)| BindingPointInfo {
                    name: n.clone(),
                    kind,
                    desc: net.tensor(*t).clone(),
                })
        };
        if let Some(info) = lookup(net.inputs(), EndpointKind::Input) {
            return Ok(info);
        }
        lookup(net.outputs(), EndpointKind::Output)
            .map(|mut info| {
                info.desc.is_constant = false;
                info
            })
            .ok_or_else(|| Error::not_found("endpoint", name))
    }

    fn execute(
        &mut self,
        network: NetworkId,
        inputs: &[InputBinding<'_>],
        outputs: &mut [OutputBinding<'_>],
    ) -> Result<()> {
        let loaded = self.loaded(network)?;
        let net = &loaded.network;

        let expected_inputs = net
            .inputs()
            .iter()
            .map(|(n, _)| self.endpoint_info(network, n.as_str()))
            .collect::<Result<Vec<_>>>()?;
        // every input must be fed; outputs nobody asked for are not written
        let expected_outputs = net
            .outputs()
            .iter()
            .filter(|(n, _)| outputs.iter().any(|b| b.name() == n))
            .map(|(n, _)| self.endpoint_info(network, n.as_str()))
            .collect::<Result<Vec<_>>>()?;
        check_bindings(&expected_inputs, inputs.iter().map(|b| (b.name(), b.desc())))?;
        check_bindings(
            &expected_outputs,
            outputs.iter().map(|b| (b.name(), b.desc())),
        )?;

        let started = Instant::now();
        let mut values: Vec<Option<Vec<f32>>> = vec![None; net.tensors().len()];
        let mut results: Vec<(usize, TensorId)> = Vec::with_capacity(outputs.len());

        for step in net.steps() {
            match step {
                Step::Input { name, tensor } => {
                    let binding = inputs
                        .iter()
                        .find(|b| b.name() == name)
                        .ok_or_else(|| Error::not_found("input", name.as_str()))?;
                    values[tensor.0] = Some(net.tensor(*tensor).decode_f32(binding.bytes())?);
                }
                Step::Constant { tensor, .. } => {
                    values[tensor.0] = loaded.constants.get(tensor).cloned();
                }
                Step::Compute {
                    name,
                    kind,
                    inputs: operands,
                    output,
                    backend,
                } => {
                    let out_desc = net.tensor(*output);
                    let mut buf = vec![0.0; out_desc.num_elements()];
                    {
                        let refs = operands
                            .iter()
                            .map(|t| {
                                let data = values[t.0].as_deref().ok_or_else(|| {
                                    Error::Execution(format!(
                                        "operand {} of '{name}' was never produced",
                                        t.0
                                    ))
                                })?;
                                Ok(TensorRef {
                                    desc: net.tensor(*t),
                                    data,
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        backend.execute(kind, &refs, &mut buf, out_desc)?;
                    }
                    debug!(layer = %name, backend = %backend.id(), "layer executed");
                    values[output.0] = Some(buf);
                }
                Step::Copy { src, dst, .. } => {
                    values[dst.0] = values[src.0].clone();
                }
                Step::Output { name, tensor } => {
                    if let Some(idx) = outputs.iter().position(|b| b.name() == name) {
                        results.push((idx, *tensor));
                    }
                }
            }
        }

        // outputs are written only once every step succeeded
        for (idx, tensor) in results {
            let data = values[tensor.0].as_deref().ok_or_else(|| {
                Error::Execution(format!("output tensor {} was never produced", tensor.0))
            })?;
            let binding = &mut outputs[idx];
            let desc = binding.desc().clone();
            desc.encode_f32(data, binding.bytes_mut())?;
        }

        info!(
            network = network.0,
            backend_us = started.elapsed().as_micros() as u64,
            "workload executed"
        );
        Ok(())
    }

    fn unload(&mut self, network: NetworkId) -> Result<()> {
        self.networks
            .remove(&network)
            .map(|_| info!(network = network.0, "network unloaded"))
            .ok_or_else(|| Error::not_found("network", network.0.to_string()))
    }
}
