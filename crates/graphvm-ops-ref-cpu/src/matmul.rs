//! Dense 2-D matrix product.

use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::tensor::Element;
use graphvm::{
    dispatch_float, BackwardContext, Error, ForwardContext, OpSpec, Operator, OperatorRegistry,
    Result, TensorMeta,
};

pub const MATMUL: &str = "MatMul";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    registry.register(MATMUL, |spec: &OpSpec<'_>| {
        spec.expect_arity(2, 1)?;
        Ok(Arc::new(MatMul) as Arc<dyn Operator>)
    })
}

struct MatMul;

/// Row-major `[m, k] x [k, n]`.
fn matmul<T: Element>(lhs: &[T], rhs: &[T], m: usize, k: usize, n: usize) -> Vec<T> {
    let mut out = vec![T::zero(); m * n];
    for i in 0..m {
        for p in 0..k {
            let a = lhs[i * k + p];
            let row = &rhs[p * n..(p + 1) * n];
            for (acc, b) in out[i * n..(i + 1) * n].iter_mut().zip(row) {
                *acc = *acc + a * *b;
            }
        }
    }
    out
}

fn transpose<T: Element>(values: &[T], rows: usize, cols: usize) -> Vec<T> {
    let mut out = vec![T::zero(); values.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = values[r * cols + c];
        }
    }
    out
}

fn dims2(kind: &str, meta: &TensorMeta) -> Result<(usize, usize)> {
    match meta.shape.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        other => Err(Error::kernel(format!(
            "{kind} expects rank-2 operands, found shape {other:?}"
        ))),
    }
}

impl MatMul {
    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let lhs = ctx.input(0)?;
        let rhs = ctx.input(1)?;
        let (m, k) = dims2(MATMUL, lhs.meta())?;
        let (_, n) = dims2(MATMUL, rhs.meta())?;
        let result = matmul(lhs.as_slice::<T>()?, rhs.as_slice::<T>()?, m, k, n);
        ctx.set_output(0, T::wrap(result))
    }

    fn backward_typed<T: Element>(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let lhs = ctx.input(0)?;
        let rhs = ctx.input(1)?;
        let (m, k) = dims2(MATMUL, lhs.meta())?;
        let (_, n) = dims2(MATMUL, rhs.meta())?;
        let grad = ctx.output_grad_values::<T>(0)?;
        if ctx.needs_input_grad(0) {
            let rhs_t = transpose(rhs.as_slice::<T>()?, k, n);
            ctx.set_input_grad(0, T::wrap(matmul(&grad, &rhs_t, m, n, k)))?;
        }
        if ctx.needs_input_grad(1) {
            let lhs_t = transpose(lhs.as_slice::<T>()?, m, k);
            ctx.set_input_grad(1, T::wrap(matmul(&lhs_t, &grad, k, m, n)))?;
        }
        Ok(())
    }
}

impl Operator for MatMul {
    fn kind(&self) -> &str {
        MATMUL
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(MATMUL, inputs.len(), 2)?;
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        if !lhs.dtype.is_float() || lhs.dtype != rhs.dtype || lhs.device != rhs.device {
            return Err(Error::shape_mismatch(MATMUL, lhs, rhs));
        }
        let (m, k) = dims2(MATMUL, lhs)?;
        let (k2, n) = dims2(MATMUL, rhs)?;
        if k != k2 {
            return Err(Error::shape_mismatch(
                MATMUL,
                format!("inner dimension {k}"),
                format!("inner dimension {k2}"),
            ));
        }
        Ok(vec![lhs.with_shape([m, n])])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, MATMUL, |T| self.forward_typed::<T>(ctx))
    }

    fn differentiable(&self) -> bool {
        true
    }

    fn backward(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, MATMUL, |T| self.backward_typed::<T>(ctx))
    }
}
