//! Views handed to operator kernels during forward and backward invocation.
//!
//! Kernels never touch the workspace directly: the executor borrows the declared inputs,
//! the kernel deposits results into the context, and the executor commits them into the
//! planned buffers only after the kernel returns successfully.

use super::Phase;
use crate::error::{Error, Result};
use crate::tensor::{DType, Element, Shape, TensorData, TensorMeta, TensorValue};

/// Read-only view of one tensor borrowed for the duration of a kernel call.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    meta: &'a TensorMeta,
    data: &'a TensorData,
}

impl<'a> TensorView<'a> {
    pub(crate) fn new(meta: &'a TensorMeta, data: &'a TensorData) -> Self {
        TensorView { meta, data }
    }

    pub fn meta(&self) -> &'a TensorMeta {
        self.meta
    }

    pub fn shape(&self) -> &'a Shape {
        &self.meta.shape
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn data(&self) -> &'a TensorData {
        self.data
    }

    /// Typed element slice; fails when the stored kind is not `T`.
    pub fn as_slice<T: Element>(&self) -> Result<&'a [T]> {
        self.data.as_slice::<T>().ok_or_else(|| {
            Error::kernel(format!(
                "expected {} elements, found {}",
                T::DTYPE,
                self.data.dtype()
            ))
        })
    }
}

fn checked_output(meta: &TensorMeta, data: TensorData, label: &str) -> Result<TensorData> {
    if data.dtype() != meta.dtype || data.len() != meta.num_elements() {
        return Err(Error::shape_mismatch(
            label,
            meta,
            format!("{}[{} elements]", data.dtype(), data.len()),
        ));
    }
    Ok(data)
}

/// Inputs and output slots for one forward invocation.
pub struct ForwardContext<'a> {
    node: &'a str,
    phase: Phase,
    inputs: Vec<TensorView<'a>>,
    output_metas: &'a [TensorMeta],
    outputs: Vec<Option<TensorData>>,
}

impl<'a> ForwardContext<'a> {
    pub(crate) fn new(
        node: &'a str,
        phase: Phase,
        inputs: Vec<TensorView<'a>>,
        output_metas: &'a [TensorMeta],
    ) -> Self {
        ForwardContext {
            node,
            phase,
            inputs,
            output_metas,
            outputs: vec![None; output_metas.len()],
        }
    }

    /// Label of the node being executed.
    pub fn node(&self) -> &str {
        self.node
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<TensorView<'a>> {
        self.inputs.get(index).copied().ok_or_else(|| {
            Error::kernel(format!("{} has no input #{index}", self.node))
        })
    }

    /// Planned metadata of output `index`, as inferred during scheduling.
    pub fn output_meta(&self, index: usize) -> Result<&'a TensorMeta> {
        self.output_metas.get(index).ok_or_else(|| {
            Error::kernel(format!("{} has no output #{index}", self.node))
        })
    }

    /// Deposits the result for output `index`; it must match the planned metadata.
    pub fn set_output(&mut self, index: usize, data: TensorData) -> Result<()> {
        let meta = self.output_meta(index)?;
        let data = checked_output(meta, data, &format!("{}:out{index}", self.node))?;
        self.outputs[index] = Some(data);
        Ok(())
    }

    pub(crate) fn into_outputs(self) -> Result<Vec<TensorValue>> {
        let node = self.node;
        self.outputs
            .into_iter()
            .zip(self.output_metas)
            .enumerate()
            .map(|(index, (data, meta))| {
                let data = data.ok_or_else(|| {
                    Error::kernel(format!("{node} did not write output #{index}"))
                })?;
                TensorValue::new(meta.clone(), data)
            })
            .collect()
    }
}

/// Forward tensors, output gradients, and input-gradient slots for one backward invocation.
pub struct BackwardContext<'a> {
    node: &'a str,
    phase: Phase,
    inputs: Vec<TensorView<'a>>,
    outputs: Vec<TensorView<'a>>,
    output_grads: Vec<Option<TensorView<'a>>>,
    wanted: &'a [bool],
    input_grads: Vec<Option<TensorData>>,
}

impl<'a> BackwardContext<'a> {
    pub(crate) fn new(
        node: &'a str,
        phase: Phase,
        inputs: Vec<TensorView<'a>>,
        outputs: Vec<TensorView<'a>>,
        output_grads: Vec<Option<TensorView<'a>>>,
        wanted: &'a [bool],
    ) -> Self {
        let slots = inputs.len();
        BackwardContext {
            node,
            phase,
            inputs,
            outputs,
            output_grads,
            wanted,
            input_grads: vec![None; slots],
        }
    }

    pub fn node(&self) -> &str {
        self.node
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Forward input `index`.
    pub fn input(&self, index: usize) -> Result<TensorView<'a>> {
        self.inputs.get(index).copied().ok_or_else(|| {
            Error::kernel(format!("{} has no input #{index}", self.node))
        })
    }

    /// Forward output `index`.
    pub fn output(&self, index: usize) -> Result<TensorView<'a>> {
        self.outputs.get(index).copied().ok_or_else(|| {
            Error::kernel(format!("{} has no output #{index}", self.node))
        })
    }

    /// Gradient flowing into forward output `index`; `None` means it is identically zero.
    pub fn output_grad(&self, index: usize) -> Option<TensorView<'a>> {
        self.output_grads.get(index).copied().flatten()
    }

    /// Gradient of output `index` materialised as a vector, zero-filled when absent.
    pub fn output_grad_values<T: Element>(&self, index: usize) -> Result<Vec<T>> {
        match self.output_grad(index) {
            Some(view) => Ok(view.as_slice::<T>()?.to_vec()),
            None => Ok(vec![T::zero(); self.output(index)?.meta().num_elements()]),
        }
    }

    /// Whether the gradient of input `index` is consumed downstream.
    pub fn needs_input_grad(&self, index: usize) -> bool {
        self.wanted.get(index).copied().unwrap_or(false)
    }

    /// Deposits the gradient of input `index`. Gradients nobody needs are dropped.
    pub fn set_input_grad(&mut self, index: usize, data: TensorData) -> Result<()> {
        if !self.needs_input_grad(index) {
            return Ok(());
        }
        let meta = self.input(index)?.meta();
        let data = checked_output(meta, data, &format!("{}:grad{index}", self.node))?;
        self.input_grads[index] = Some(data);
        Ok(())
    }

    /// Gradients for every wanted input, in input order.
    pub(crate) fn into_input_grads(self) -> Result<Vec<TensorValue>> {
        let node = self.node;
        let mut grads = Vec::new();
        for (index, (slot, wanted)) in self.input_grads.into_iter().zip(self.wanted).enumerate() {
            if !*wanted {
                continue;
            }
            let data = slot.ok_or_else(|| {
                Error::kernel(format!("{node} did not produce the gradient of input #{index}"))
            })?;
            grads.push(TensorValue::new(self.inputs[index].meta().clone(), data)?);
        }
        Ok(grads)
    }
}
