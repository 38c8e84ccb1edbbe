//! Kinds with no gradient: integer-valued selections and constants.

use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::tensor::Element;
use graphvm::{
    dispatch_float, DType, Device, Error, ForwardContext, OpSpec, Operator, OperatorRegistry,
    Result, Shape, TensorData, TensorMeta,
};

pub const ARGMAX: &str = "ArgMax";
pub const FILL: &str = "Fill";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    registry.register(ARGMAX, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        Ok(Arc::new(ArgMax) as Arc<dyn Operator>)
    })?;
    registry.register(FILL, |spec: &OpSpec<'_>| {
        spec.expect_arity(0, 1)?;
        let shape = Shape::new(spec.require_dims("shape")?);
        let dtype = match spec.str_opt("dtype")? {
            Some(raw) => DType::parse(raw).ok_or_else(|| {
                Error::invalid_config(spec.kind, format!("unknown dtype `{raw}`"))
            })?,
            None => DType::F32,
        };
        let device = match spec.str_opt("device")? {
            Some(raw) => raw
                .parse::<Device>()
                .map_err(|reason| Error::invalid_config(spec.kind, reason))?,
            None => Device::Host,
        };
        Ok(Arc::new(Fill {
            meta: TensorMeta::new(shape, dtype, device),
            value: spec.f64_or("value", 0.0)?,
        }) as Arc<dyn Operator>)
    })?;
    Ok(())
}

/// Index of the largest element along the last axis, as `i32`. Ties pick the first index.
struct ArgMax;

impl ArgMax {
    fn forward_typed<T: Element>(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let input = ctx.input(0)?;
        let row = input.shape().dims().last().copied().unwrap_or(1);
        let values = input.as_slice::<T>()?;
        let result: Vec<i32> = values
            .chunks(row.max(1))
            .map(|chunk| {
                let mut best = 0usize;
                for (index, value) in chunk.iter().enumerate() {
                    if *value > chunk[best] {
                        best = index;
                    }
                }
                best as i32
            })
            .collect();
        ctx.set_output(0, TensorData::I32(result))
    }
}

impl Operator for ArgMax {
    fn kind(&self) -> &str {
        ARGMAX
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(ARGMAX, inputs.len(), 1)?;
        let input = &inputs[0];
        let dims = input.shape.dims();
        match dims.split_last() {
            Some((last, rest)) if *last > 0 && input.dtype.is_float() => Ok(vec![TensorMeta::new(
                rest,
                DType::I32,
                input.device,
            )]),
            _ => Err(Error::kernel(format!(
                "{ARGMAX} needs a non-empty floating-point axis, found {input}"
            ))),
        }
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let dtype = ctx.input(0)?.dtype();
        dispatch_float!(dtype, ARGMAX, |T| self.forward_typed::<T>(ctx))
    }

    fn stops_gradient(&self) -> bool {
        true
    }
}

/// Constant tensor described entirely by configuration.
struct Fill {
    meta: TensorMeta,
    value: f64,
}

impl Operator for Fill {
    fn kind(&self) -> &str {
        FILL
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(FILL, inputs.len(), 0)?;
        Ok(vec![self.meta.clone()])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let meta = ctx.output_meta(0)?;
        ctx.set_output(
            0,
            TensorData::filled(meta.dtype, meta.num_elements(), self.value),
        )
    }

    fn stops_gradient(&self) -> bool {
        true
    }
}
