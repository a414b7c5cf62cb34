use bytes::Bytes;

use crate::{Error, Graph, Result};

/// Where a serialized model description comes from.
#[derive(Clone, Debug)]
pub enum ModelArtifact {
    Path(std::path::PathBuf),
    Bytes(Bytes),
}

impl ModelArtifact {
    /// Fails with [`Error::Io`] when the backing file cannot be read.
    pub fn load_bytes(&self) -> Result<Bytes> {
        match self {
            ModelArtifact::Path(path) => std::fs::read(path)
                .map(Bytes::from)
                .map_err(|e| Error::io(path, e)),
            ModelArtifact::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Turns an opaque serialized model into a [`Graph`].
pub trait ModelParser {
    fn name(&self) -> &'static str;
    fn parse(&self, bytes: &[u8]) -> Result<Graph>;

    fn parse_artifact(&self, artifact: &ModelArtifact) -> Result<Graph> {
        let bytes = artifact.load_bytes()?;
        self.parse(&bytes)
    }
}
