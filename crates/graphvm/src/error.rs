//! Error taxonomy shared by graph construction, scheduling, and execution.
//!
//! Structural errors (`CyclicGraph`, `DanglingInput`, `MultipleProducers`, `DuplicateKind`,
//! `UnknownKind`, `InvalidConfig`) surface while a graph is being built or compiled. Runtime
//! errors are wrapped in [`Error::NodeFailed`] by the executor so callers always learn which
//! node aborted the run.

use thiserror::Error;

use crate::tensor::Device;

/// Errors produced by the execution engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("operator kind `{kind}` is not registered")]
    UnknownKind { kind: String },

    #[error("operator kind `{kind}` is already registered")]
    DuplicateKind { kind: String },

    #[error("invalid configuration for `{kind}`: {reason}")]
    InvalidConfig { kind: String, reason: String },

    #[error("graph contains a dependency cycle: {}", cycle.join(" -> "))]
    CyclicGraph { cycle: Vec<String> },

    #[error("node `{node}` reads `{tensor}`, which is neither an input nor produced by a node")]
    DanglingInput { node: String, tensor: String },

    #[error("tensor `{tensor}` is written by more than one producer (`{first}` and `{second}`)")]
    MultipleProducers {
        tensor: String,
        first: String,
        second: String,
    },

    #[error("tensor `{name}` is not bound in the workspace")]
    UnknownTensor { name: String },

    #[error("tensor `{name}` was released or rebound; the handle is stale")]
    StaleTensor { name: String },

    #[error("shape mismatch for `{name}`: expected {expected}, found {found}")]
    ShapeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("out of memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: Device,
        requested: u64,
        available: u64,
    },

    #[error("operator kind `{kind}` (node `{node}`) has no gradient defined")]
    NoGradientDefined { kind: String, node: String },

    #[error("gradient terminal `{terminal}` is unreachable from every tensor requiring gradients")]
    DisconnectedGraph { terminal: String },

    #[error("`{name}` is not a gradient terminal of this plan")]
    NotATerminal { name: String },

    #[error("kernel failure: {message}")]
    Kernel { message: String },

    #[error("node `{node}` ({kind}) failed: {source}")]
    NodeFailed {
        node: String,
        kind: String,
        #[source]
        source: Box<Error>,
    },

    #[error("run cancelled after {completed} completed steps")]
    Cancelled { completed: usize },
}

impl Error {
    pub fn invalid_config(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn kernel(message: impl Into<String>) -> Self {
        Error::Kernel {
            message: message.into(),
        }
    }

    pub fn unknown_tensor(name: impl Into<String>) -> Self {
        Error::UnknownTensor { name: name.into() }
    }

    pub fn shape_mismatch(
        name: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Error::ShapeMismatch {
            name: name.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Attaches node identity to a runtime failure.
    pub fn at_node(self, node: &str, kind: &str) -> Self {
        match self {
            already @ Error::NodeFailed { .. } => already,
            other => Error::NodeFailed {
                node: node.to_string(),
                kind: kind.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, unwrapping any node attribution.
    pub fn root(&self) -> &Error {
        match self {
            Error::NodeFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error is detected before any execution begins.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.root(),
            Error::UnknownKind { .. }
                | Error::DuplicateKind { .. }
                | Error::InvalidConfig { .. }
                | Error::CyclicGraph { .. }
                | Error::DanglingInput { .. }
                | Error::MultipleProducers { .. }
        )
    }
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, Error>;
