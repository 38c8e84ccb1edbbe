//! Parameter update rules driven by `FunctionBuilder::updater`.
//!
//! Update kinds read `(param, grad, history)` and produce `(param, history)`; the executor
//! writes both results back into the buffers they were read from.

use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::tensor::Element;
use graphvm::{
    dispatch_float, Error, ForwardContext, OpSpec, Operator, OperatorRegistry, Result, TensorMeta,
};

use crate::same_float_meta;

pub const SGD: &str = "Sgd";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    registry.register(SGD, |spec: &OpSpec<'_>| {
        spec.expect_arity(3, 2)?;
        let lr = spec.require_f64("lr")?;
        let momentum = spec.f64_or("momentum", 0.0)?;
        if !lr.is_finite() {
            return Err(Error::invalid_config(spec.kind, "lr must be finite"));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(Error::invalid_config(
                spec.kind,
                format!("momentum must lie in [0, 1), got {momentum}"),
            ));
        }
        Ok(Arc::new(Sgd { lr, momentum }) as Arc<dyn Operator>)
    })
}

/// `history = momentum * history + lr * grad; param -= history`.
struct Sgd {
    lr: f64,
    momentum: f64,
}

impl Sgd {
    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let param = ctx.input(0)?.as_slice::<T>()?;
        let grad = ctx.input(1)?.as_slice::<T>()?;
        let history = ctx.input(2)?.as_slice::<T>()?;
        let lr = T::from_f64(self.lr);
        let momentum = T::from_f64(self.momentum);
        let next_history: Vec<T> = history
            .iter()
            .zip(grad)
            .map(|(h, g)| momentum * *h + lr * *g)
            .collect();
        let next_param: Vec<T> = param
            .iter()
            .zip(&next_history)
            .map(|(p, h)| *p - *h)
            .collect();
        ctx.set_output(0, T::wrap(next_param))?;
        ctx.set_output(1, T::wrap(next_history))
    }
}

impl Operator for Sgd {
    fn kind(&self) -> &str {
        SGD
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(SGD, inputs.len(), 3)?;
        let meta = same_float_meta(SGD, inputs)?;
        Ok(vec![meta.clone(), meta.clone()])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, SGD, |T| self.forward_typed::<T>(ctx))
    }

    fn stops_gradient(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphvm::OpConfig;

    fn create(config: OpConfig) -> Result<Arc<dyn Operator>> {
        let registry = OperatorRegistry::empty();
        register(&registry)?;
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        registry.create(
            SGD,
            &names(&["w", "w_grad", "w_history"]),
            &names(&["w", "w_history"]),
            &config,
        )
    }

    #[test]
    fn rejects_missing_rate_and_bad_momentum() {
        assert!(matches!(
            create(OpConfig::new()).err(),
            Some(Error::InvalidConfig { .. })
        ));
        assert!(matches!(
            create(OpConfig::new().with("lr", 0.1).with("momentum", 1.0)).err(),
            Some(Error::InvalidConfig { .. })
        ));
        assert!(create(OpConfig::new().with("lr", 0.1).with("momentum", 0.9)).is_ok());
    }
}
