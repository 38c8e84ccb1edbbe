//! Kinds the engine itself emits while synthesising backward graphs.

use std::sync::Arc;

use super::{ensure_arity, ForwardContext, OpSpec, Operator, OperatorRegistry};
use crate::dispatch_float;
use crate::error::{Error, Result};
use crate::tensor::{Element, TensorData, TensorMeta};

/// Sums partial gradients in input order.
pub const GRADIENT_ACCUMULATE: &str = "GradientAccumulate";
/// Writes zeros shaped like its single input.
pub const ZEROS_LIKE: &str = "ZerosLike";

pub(crate) fn install(registry: &OperatorRegistry) {
    // Fresh registries cannot collide, so the results are always Ok.
    let _ = registry.register(GRADIENT_ACCUMULATE, |spec: &OpSpec<'_>| {
        if spec.inputs.is_empty() || spec.outputs.len() != 1 {
            return Err(Error::invalid_config(
                spec.kind,
                "expected at least one input and exactly one output",
            ));
        }
        Ok(accumulate())
    });
    let _ = registry.register(ZEROS_LIKE, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        Ok(zeros_like())
    });
}

pub(crate) fn accumulate() -> Arc<dyn Operator> {
    Arc::new(GradientAccumulate)
}

pub(crate) fn zeros_like() -> Arc<dyn Operator> {
    Arc::new(ZerosLike)
}

struct GradientAccumulate;

impl GradientAccumulate {
    fn sum<T: Element>(ctx: &mut ForwardContext<'_>) -> Result<()> {
        let mut total: Vec<T> = ctx.input(0)?.as_slice::<T>()?.to_vec();
        for index in 1..ctx.num_inputs() {
            let part = ctx.input(index)?.as_slice::<T>()?;
            for (acc, value) in total.iter_mut().zip(part) {
                *acc = *acc + *value;
            }
        }
        ctx.set_output(0, T::wrap(total))
    }
}

impl Operator for GradientAccumulate {
    fn kind(&self) -> &str {
        GRADIENT_ACCUMULATE
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::kernel("gradient accumulation needs at least one input"))?;
        if let Some(other) = inputs.iter().find(|meta| *meta != first) {
            return Err(Error::shape_mismatch("accumulated gradient", first, other));
        }
        Ok(vec![first.clone()])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, GRADIENT_ACCUMULATE, |T| Self::sum::<T>(ctx))
    }
}

struct ZerosLike;

impl Operator for ZerosLike {
    fn kind(&self) -> &str {
        ZEROS_LIKE
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(ZEROS_LIKE, inputs.len(), 1)?;
        Ok(inputs.to_vec())
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let meta = ctx.output_meta(0)?;
        ctx.set_output(0, TensorData::zeros(meta.dtype, meta.num_elements()))
    }
}
