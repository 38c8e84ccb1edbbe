//! Operator capability contract, registry, and the engine's own built-in kinds.
//!
//! Every operator kind implements [`Operator`]: shape inference, a forward kernel, and an
//! optional backward kernel. The scheduler and executor only ever talk to this trait, so new
//! kinds register through an [`OperatorRegistry`] without touching either of them.

pub mod builtin;
mod config;
mod context;
mod registry;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::TensorMeta;

pub use config::{ConfigValue, OpConfig, OpSpec};
pub use context::{BackwardContext, ForwardContext, TensorView};
pub use registry::{OperatorFactory, OperatorRegistry};

/// Execution phase observed by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Test,
}

impl Phase {
    pub fn is_training(self) -> bool {
        matches!(self, Phase::Train)
    }
}

/// Capability set of one instantiated operator.
pub trait Operator: Send + Sync {
    /// Registered kind name, e.g. `"Add"`.
    fn kind(&self) -> &str;

    /// Output metadata for the given input metadata. Called once per input signature.
    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>>;

    /// Reads the declared inputs and deposits every declared output.
    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()>;

    /// Whether [`Operator::backward`] is implemented.
    fn differentiable(&self) -> bool {
        false
    }

    /// Local reverse-mode derivative: output gradients in, input gradients out.
    fn backward(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        Err(Error::NoGradientDefined {
            kind: self.kind().to_string(),
            node: ctx.node().to_string(),
        })
    }

    /// Outputs are treated as constants by the gradient builder (e.g. argmax, sampling).
    fn stops_gradient(&self) -> bool {
        false
    }

    /// Output 0 may be written into the buffer of input 0 when that input dies here.
    fn in_place_safe(&self) -> bool {
        false
    }
}

/// Shape-inference guard for kinds with a fixed input count.
pub fn ensure_arity(kind: &str, found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(Error::kernel(format!(
            "{kind} expects {expected} input(s), got {found}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_reports_training() {
        assert!(Phase::Train.is_training());
        assert!(!Phase::Test.is_training());
    }
}
