use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, LayerKind, Result, TensorDescriptor};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(Cow<'static, str>);

impl BackendId {
    pub const CPU_REF: BackendId = BackendId(Cow::Borrowed("CpuRef"));
    pub const CPU_ACC: BackendId = BackendId(Cow::Borrowed("CpuAcc"));
    pub const GPU_ACC: BackendId = BackendId(Cow::Borrowed("GpuAcc"));

    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backends in the order they should be tried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendPreference(Vec<BackendId>);

impl BackendPreference {
    pub fn new(ids: impl IntoIterator<Item = BackendId>) -> Self {
        Self(ids.into_iter().collect())
    }

    /// `GpuAcc, CpuAcc, CpuRef`: accelerated first, reference last.
    pub fn with_fallback() -> Self {
        Self::new([BackendId::GPU_ACC, BackendId::CPU_ACC, BackendId::CPU_REF])
    }

    pub fn ids(&self) -> &[BackendId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for BackendPreference {
    fn default() -> Self {
        Self::with_fallback()
    }
}

impl FromStr for BackendPreference {
    type Err = Error;

    /// Parses a comma separated list such as `GpuAcc,CpuRef`.
    fn from_str(s: &str) -> Result<Self> {
        let ids: Vec<BackendId> = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(BackendId::new)
            .collect();
        if ids.is_empty() {
            return Err(Error::constraint("backend preference list is empty"));
        }
        Ok(Self(ids))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Host,
    Device(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub memory: MemorySpace,
    /// Can read tensors staged in host memory.
    pub host_import: bool,
    /// Can stage its tensors into host memory.
    pub host_export: bool,
}

impl BackendCapabilities {
    /// Where graph inputs and constants live before any backend touches them.
    pub const HOST: BackendCapabilities = BackendCapabilities {
        memory: MemorySpace::Host,
        host_import: true,
        host_export: true,
    };

    /// Whether a tensor produced under `src` can be handed to a layer running here.
    pub fn can_receive_from(&self, src: &BackendCapabilities) -> bool {
        self.memory == src.memory || (src.host_export && self.host_import)
    }
}

/// A tensor handed to a kernel, already converted to real values.
#[derive(Clone, Copy, Debug)]
pub struct TensorRef<'a> {
    pub desc: &'a TensorDescriptor,
    pub data: &'a [f32],
}

pub trait Backend: Send + Sync + 'static {
    fn id(&self) -> BackendId;
    fn capabilities(&self) -> BackendCapabilities;

    /// `Err(reason)` when this backend cannot run the layer with these operands.
    fn check_support(
        &self,
        layer: &LayerKind,
        inputs: &[&TensorDescriptor],
        output: &TensorDescriptor,
    ) -> std::result::Result<(), String>;

    /// Runs one compute layer, writing `output.len() == output_desc.num_elements()` values.
    fn execute(
        &self,
        layer: &LayerKind,
        inputs: &[TensorRef<'_>],
        output: &mut [f32],
        output_desc: &TensorDescriptor,
    ) -> Result<()>;
}

/// The backends a runtime can actually reach on this machine.
#[derive(Clone, Default)]
pub struct DeviceSpec {
    backends: Vec<Arc<dyn Backend>>,
}

impl DeviceSpec {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    pub fn backend(&self, id: &BackendId) -> Option<&Arc<dyn Backend>> {
        self.backends.iter().find(|b| &b.id() == id)
    }

    pub fn supported_ids(&self) -> Vec<BackendId> {
        self.backends.iter().map(|b| b.id()).collect()
    }
}

impl fmt::Debug for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSpec")
            .field("backends", &self.supported_ids())
            .finish()
    }
}
