use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::ops::{OpConfig, Operator};

/// How the executor calls into a node's operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) enum Invocation {
    Forward,
    /// Calls `backward` on the forward node's operator.
    ///
    /// Inputs are laid out as the forward inputs, then the forward outputs, then one gradient
    /// per forward output flagged in `output_grads`. Outputs are the gradients of the forward
    /// inputs flagged in `input_grads`, in input order.
    Backward(GradientBinding),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct GradientBinding {
    pub(crate) forward_inputs: usize,
    pub(crate) forward_outputs: usize,
    pub(crate) output_grads: Vec<bool>,
    pub(crate) input_grads: Vec<bool>,
}

/// One operator instance wired to named tensors.
#[derive(Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) config: OpConfig,
    pub(crate) op: Arc<dyn Operator>,
    pub(crate) invocation: Invocation,
    /// Emitted by the gradient builder; its outputs are gradient tensors.
    pub(crate) gradient: bool,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn config(&self) -> &OpConfig {
        &self.config
    }

    pub fn is_backward(&self) -> bool {
        matches!(self.invocation, Invocation::Backward(_))
    }

    /// Whether the node belongs to the synthesised backward graph.
    pub fn is_gradient(&self) -> bool {
        self.gradient
    }

    pub(crate) fn operator(&self) -> &Arc<dyn Operator> {
        &self.op
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("invocation", &self.invocation)
            .finish()
    }
}
