//! Full reductions to a scalar.

use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::tensor::Element;
use graphvm::{
    dispatch_float, BackwardContext, ForwardContext, OpSpec, Operator, OperatorRegistry, Result,
    Shape, TensorMeta,
};

use crate::same_float_meta;

pub const SUM: &str = "Sum";
pub const MEAN: &str = "Mean";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    registry.register(SUM, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        Ok(Arc::new(Reduce { mean: false }) as Arc<dyn Operator>)
    })?;
    registry.register(MEAN, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        Ok(Arc::new(Reduce { mean: true }) as Arc<dyn Operator>)
    })?;
    Ok(())
}

struct Reduce {
    mean: bool,
}

impl Reduce {
    /// Divisor applied to the total; the mean of an empty tensor is defined as zero.
    fn divisor<T: Element>(&self, len: usize) -> T {
        if self.mean && len > 0 {
            T::from_f64(len as f64)
        } else {
            T::one()
        }
    }

    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let input = ctx.input(0)?.as_slice::<T>()?;
        let total = input.iter().fold(T::zero(), |acc, x| acc + *x);
        let result = total / self.divisor::<T>(input.len());
        ctx.set_output(0, T::wrap(vec![result]))
    }

    fn backward_typed<T: Element>(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let grad = ctx.output_grad_values::<T>(0)?;
        let len = ctx.input(0)?.meta().num_elements();
        let upstream = grad.first().copied().unwrap_or_else(T::zero);
        let share = upstream / self.divisor::<T>(len);
        ctx.set_input_grad(0, T::wrap(vec![share; len]))
    }
}

impl Operator for Reduce {
    fn kind(&self) -> &str {
        if self.mean {
            MEAN
        } else {
            SUM
        }
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(self.kind(), inputs.len(), 1)?;
        let input = same_float_meta(self.kind(), inputs)?;
        Ok(vec![input.with_shape(Shape::scalar())])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, self.kind(), |T| self.forward_typed::<T>(ctx))
    }

    fn differentiable(&self) -> bool {
        true
    }

    fn backward(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, self.kind(), |T| self.backward_typed::<T>(ctx))
    }
}
