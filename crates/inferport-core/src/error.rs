use std::path::PathBuf;

use crate::{BackendId, DType};

/// Every failure the inference pipeline can report.
///
/// None of these are retried internally. `Optimization` and `Load` carry the
/// backend list that was tried so the caller can retry with a narrower one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file could not be opened or read.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad magic number, truncated record or malformed model description.
    #[error("format error: {0}")]
    Format(String),

    /// A graph invariant was violated at build time (unconnected slot, unset shape, ...).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A requested endpoint or node name does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Buffer element count differs from the descriptor's element count.
    #[error("size mismatch for '{name}': descriptor needs {expected} elements, buffer has {got}")]
    SizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Buffer element type differs from the descriptor's element type.
    #[error("dtype mismatch for '{name}': descriptor is {expected:?}, buffer is {got:?}")]
    DTypeMismatch {
        name: String,
        expected: DType,
        got: DType,
    },

    /// No feasible backend assignment exists for the graph.
    #[error("optimization failed with backends [{}]: {reason}", join_ids(.backends))]
    Optimization {
        backends: Vec<BackendId>,
        reason: String,
    },

    /// The runtime rejected the optimized network.
    #[error("loading failed with backends [{}]: {reason}", join_ids(.backends))]
    Load {
        backends: Vec<BackendId>,
        reason: String,
    },

    /// A kernel rejected its operands while the workload was running.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A pipeline step was requested from a state that does not allow it.
    #[error("cannot {operation} while pipeline is {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Error::Constraint(msg.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// True for failures a caller may get past by retrying with a different
    /// backend preference.
    pub fn is_retryable_with_other_backends(&self) -> bool {
        matches!(self, Error::Optimization { .. } | Error::Load { .. })
    }
}

fn join_ids(ids: &[BackendId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
