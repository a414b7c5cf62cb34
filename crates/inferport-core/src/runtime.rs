use crate::{
    optimize, BackendPreference, BindingPointInfo, DeviceSpec, Graph, InputBinding,
    OptimizedNetwork, OutputBinding, Result,
};

/// Handle to a network resident in a [`Runtime`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u32);

/// The execution side of the pipeline: owns loaded networks and runs them.
pub trait Runtime {
    /// Backends reachable on this machine.
    fn device_spec(&self) -> DeviceSpec;

    /// Installs an optimized network. Fails with [`crate::Error::Load`] when
    /// the runtime cannot host it.
    fn load(&mut self, network: OptimizedNetwork) -> Result<NetworkId>;

    /// Authoritative descriptor of a named input or output of a loaded network.
    fn endpoint_info(&self, network: NetworkId, name: &str) -> Result<BindingPointInfo>;

    /// One blocking run. On success every output buffer holds its full result.
    fn execute(
        &mut self,
        network: NetworkId,
        inputs: &[InputBinding<'_>],
        outputs: &mut [OutputBinding<'_>],
    ) -> Result<()>;

    fn unload(&mut self, network: NetworkId) -> Result<()>;
}

/// Optimizes `graph` against the runtime's device and loads the result.
pub fn optimize_and_load<R: Runtime + ?Sized>(
    runtime: &mut R,
    graph: &Graph,
    preference: &BackendPreference,
) -> Result<NetworkId> {
    let optimized = optimize(graph, preference, &runtime.device_spec())?;
    runtime.load(optimized)
}

/// Lets a pipeline borrow a runtime that outlives it.
impl<R: Runtime + ?Sized> Runtime for &mut R {
    fn device_spec(&self) -> DeviceSpec {
        (**self).device_spec()
    }

    fn load(&mut self, network: OptimizedNetwork) -> Result<NetworkId> {
        (**self).load(network)
    }

    fn endpoint_info(&self, network: NetworkId, name: &str) -> Result<BindingPointInfo> {
        (**self).endpoint_info(network, name)
    }

    fn execute(
        &mut self,
        network: NetworkId,
        inputs: &[InputBinding<'_>],
        outputs: &mut [OutputBinding<'_>],
    ) -> Result<()> {
        (**self).execute(network, inputs, outputs)
    }

    fn unload(&mut self, network: NetworkId) -> Result<()> {
        (**self).unload(network)
    }
}
