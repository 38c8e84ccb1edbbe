//! Layout and placement kinds that move data without arithmetic.

use std::sync::Arc;

use graphvm::ops::ensure_arity;
use graphvm::{
    BackwardContext, Device, Error, ForwardContext, OpSpec, Operator, OperatorRegistry, Result,
    Shape, TensorData, TensorMeta,
};

pub const RESHAPE: &str = "Reshape";
pub const COPY: &str = "Copy";

pub(crate) fn register(registry: &OperatorRegistry) -> Result<()> {
    registry.register(RESHAPE, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        let dims = spec.require_dims("shape")?;
        Ok(Arc::new(Reshape {
            shape: Shape::new(dims),
        }) as Arc<dyn Operator>)
    })?;
    registry.register(COPY, |spec: &OpSpec<'_>| {
        spec.expect_arity(1, 1)?;
        let device = match spec.str_opt("device")? {
            Some(raw) => raw
                .parse::<Device>()
                .map_err(|reason| Error::invalid_config(spec.kind, reason))?,
            None => Device::Host,
        };
        Ok(Arc::new(DeviceCopy { device }) as Arc<dyn Operator>)
    })?;
    Ok(())
}

/// Hands the output gradient back unchanged; only the metadata differs between the two sides.
fn pass_gradient_through(ctx: &mut BackwardContext<'_>) -> Result<()> {
    let grad = match ctx.output_grad(0) {
        Some(view) => view.data().clone(),
        None => {
            let meta = ctx.input(0)?.meta();
            TensorData::zeros(meta.dtype, meta.num_elements())
        }
    };
    ctx.set_input_grad(0, grad)
}

/// Reinterprets the element sequence under a new shape of equal element count.
struct Reshape {
    shape: Shape,
}

impl Operator for Reshape {
    fn kind(&self) -> &str {
        RESHAPE
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(RESHAPE, inputs.len(), 1)?;
        let input = &inputs[0];
        let target = input.with_shape(self.shape.clone());
        if target.num_elements() != input.num_elements() {
            return Err(Error::shape_mismatch(RESHAPE, input, &target));
        }
        Ok(vec![target])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let data = ctx.input(0)?.data().clone();
        ctx.set_output(0, data)
    }

    fn differentiable(&self) -> bool {
        true
    }

    fn backward(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        pass_gradient_through(ctx)
    }

    fn in_place_safe(&self) -> bool {
        true
    }
}

/// Moves a tensor to another device.
struct DeviceCopy {
    device: Device,
}

impl Operator for DeviceCopy {
    fn kind(&self) -> &str {
        COPY
    }

    fn infer_outputs(&self, inputs: &[TensorMeta]) -> Result<Vec<TensorMeta>> {
        ensure_arity(COPY, inputs.len(), 1)?;
        Ok(vec![inputs[0].with_device(self.device)])
    }

    fn forward(&self, ctx: &mut ForwardContext<'_>) -> Result<()> {
        let data = ctx.input(0)?.data().clone();
        ctx.set_output(0, data)
    }

    fn differentiable(&self) -> bool {
        true
    }

    fn backward(&self, ctx: &mut BackwardContext<'_>) -> Result<()> {
        pass_gradient_through(ctx)
    }
}
