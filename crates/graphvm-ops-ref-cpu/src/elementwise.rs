use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::tensor::Element;
use graphvm::{
    dispatch_float, BackwardContext, Error, ForwardContext, OpSpec, Operator, OperatorRegistry,
    Result, TensorMeta,
};

use crate::same_float_meta;

pub const ADD: &str = "Add";
pub const SUB: &str = "Sub";
pub const MUL: &str = "Mul";
pub const SCALE: &str = "Scale";
pub const RELU: &str = "Relu";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul] {
        registry.register(op.kind(), move |spec: &OpSpec<'_>| {
            spec.expect_arity(2, 1)?;
            Ok(Arc::new(Binary(op)) as Arc<dyn Operator>)
        })?;
    }
    registry.register(SCALE, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        let alpha = spec.require_f64("alpha")?;
        if !alpha.is_finite() {
            return Err(Error::invalid_config(spec.kind, "alpha must be finite"));
        }
        Ok(Arc::new(Unary(UnaryOp::Scale(alpha))) as Arc<dyn Operator>)
    })?;
    registry.register(RELU, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        Ok(Arc::new(Unary(UnaryOp::Relu)) as Arc<dyn Operator>)
    })?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    fn kind(self) -> &'static str {
        match self {
            BinaryOp::Add => ADD,
            BinaryOp::Sub => SUB,
            BinaryOp::Mul => MUL,
        }
    }

    fn apply<T: Element>(self, lhs: T, rhs: T) -> T {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
        }
    }
}

struct Binary(BinaryOp);

impl Binary {
    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let lhs = ctx.input(0)?.as_slice::<T>()?;
        let rhs = ctx.input(1)?.as_slice::<T>()?;
        let result: Vec<T> = lhs
            .iter()
            .zip(rhs)
            .map(|(x, y)| self.0.apply(*x, *y))
            .collect();
        ctx.set_output(0, T::wrap(result))
    }

    fn backward_typed<T: Element>(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let grad = ctx.output_grad_values::<T>(0)?;
        let (lhs_grad, rhs_grad): (Vec<T>, Vec<T>) = match self.0 {
            BinaryOp::Add => (grad.clone(), grad),
            BinaryOp::Sub => {
                let negated = grad.iter().map(|g| -*g).collect();
                (grad, negated)
            }
            BinaryOp::Mul => {
                let lhs = ctx.input(0)?.as_slice::<T>()?;
                let rhs = ctx.input(1)?.as_slice::<T>()?;
                (
                    grad.iter().zip(rhs).map(|(g, y)| *g * *y).collect(),
                    grad.iter().zip(lhs).map(|(g, x)| *g * *x).collect(),
                )
            }
        };
        ctx.set_input_grad(0, T::wrap(lhs_grad))?;
        ctx.set_input_grad(1, T::wrap(rhs_grad))
    }
}

impl Operator for Binary {
    fn kind(&self) -> &str {
        self.0.kind()
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(self.kind(), inputs.len(), 2)?;
        Ok(vec![same_float_meta(self.kind(), inputs)?.clone()])
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

    fn in_place_safe(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Scale(f64),
    Relu,
}

struct Unary(UnaryOp);

impl Unary {
    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let input = ctx.input(0)?.as_slice::<T>()?;
        let result: Vec<T> = match self.0 {
            UnaryOp::Scale(alpha) => {
                let alpha = T::from_f64(alpha);
                input.iter().map(|x| *x * alpha).collect()
            }
            UnaryOp::Relu => input
                .iter()
                .map(|x| if *x > T::zero() { *x } else { T::zero() })
                .collect(),
        };
        ctx.set_output(0, T::wrap(result))
    }

    fn backward_typed<T: Element>(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let grad = ctx.output_grad_values::<T>(0)?;
        let input_grad: Vec<T> = match self.0 {
            UnaryOp::Scale(alpha) => {
                let alpha = T::from_f64(alpha);
                grad.iter().map(|g| *g * alpha).collect()
            }
            UnaryOp::Relu => {
                let input = ctx.input(0)?.as_slice::<T>()?;
                grad.iter()
                    .zip(input)
                    .map(|(g, x)| if *x > T::zero() { *g } else { T::zero() })
                    .collect()
            }
        };
        ctx.set_input_grad(0, T::wrap(input_grad))
    }
}

impl Operator for Unary {
    fn kind(&self) -> &str {
        match self.0 {
            UnaryOp::Scale(_) => SCALE,
            UnaryOp::Relu => RELU,
        }
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(self.kind(), inputs.len(), 1)?;
        Ok(vec![same_float_meta(self.kind(), inputs)?.clone()])
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

    fn in_place_safe(&self) -> bool {
        true
    }
}
