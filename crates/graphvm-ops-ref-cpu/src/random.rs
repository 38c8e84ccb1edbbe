//! Stochastic kinds.
//!
//! Masks are a pure function of the configured seed and the element count, so the backward
//! step regenerates the exact mask the forward step applied instead of storing it.

use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::tensor::Element;
use graphvm::{
    dispatch_float, BackwardContext, Error, ForwardContext, OpSpec, Operator, OperatorRegistry,
    Result, TensorMeta,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::same_float_meta;

pub const DROPOUT: &str = "Dropout";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    registry.register(DROPOUT, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        let prob = spec.f64_or("prob", 0.5)?;
        if !(0.0..1.0).contains(&prob) {
            return Err(Error::invalid_config(
                spec.kind,
                format!("prob must lie in [0, 1), got {prob}"),
            ));
        }
        let seed = spec.i64_or("seed", 0)?;
        Ok(Arc::new(Dropout {
            prob,
            seed: seed as u64,
        }) as Arc<dyn Operator>)
    })
}

/// Inverted dropout: kept elements are scaled by `1 / (1 - prob)` in training, and the
/// operator is the identity in the test phase.
struct Dropout {
    prob: f64,
    seed: u64,
}

impl Dropout {
    fn mask<T: Element>(&self, len: usize) -> Vec<T> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let keep = T::from_f64(1.0 / (1.0 - self.prob));
        (0..len)
            .map(|_| {
                if rng.gen::<f64>() < self.prob {
                    T::zero()
                } else {
                    keep
                }
            })
            .collect()
    }

    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let input = ctx.input(0)?.as_slice::<T>()?;
        let result: Vec<T> = if ctx.phase().is_training() {
            input
                .iter()
                .zip(self.mask::<T>(input.len()))
                .map(|(x, m)| *x * m)
                .collect()
        } else {
            input.to_vec()
        };
        ctx.set_output(0, T::wrap(result))
    }

    fn backward_typed<T: Element>(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let grad = ctx.output_grad_values::<T>(0)?;
        let input_grad: Vec<T> = if ctx.phase().is_training() {
            grad.iter()
                .zip(self.mask::<T>(grad.len()))
                .map(|(g, m)| *g * m)
                .collect()
        } else {
            grad
        };
        ctx.set_input_grad(0, T::wrap(input_grad))
    }
}

impl Operator for Dropout {
    fn kind(&self) -> &str {
        DROPOUT
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(DROPOUT, inputs.len(), 1)?;
        Ok(vec![same_float_meta(DROPOUT, inputs)?.clone()])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, DROPOUT, |T| self.forward_typed::<T>(ctx))
    }

    fn differentiable(&self) -> bool {
        true
    }

    fn backward(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, DROPOUT, |T| self.backward_typed::<T>(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_reproducible_and_scaled() {
        let dropout = Dropout {
            prob: 0.25,
            seed: 7,
        };
        let first = dropout.mask::<f64>(64);
        assert_eq!(first, dropout.mask::<f64>(64));
        assert!(first.iter().all(|m| *m == 0.0 || (*m - 4.0 / 3.0).abs() < 1e-12));
        assert!(first.iter().any(|m| *m == 0.0));
    }

    #[test]
    fn zero_probability_keeps_everything() {
        let dropout = Dropout { prob: 0.0, seed: 3 };
        assert!(dropout.mask::<f32>(16).iter().all(|m| *m == 1.0));
    }
}
