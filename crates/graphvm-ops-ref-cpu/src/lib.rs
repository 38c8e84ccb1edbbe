//! Reference host kernels for the graphvm operator kinds.
//!
//! Every kernel runs on host-resident storage regardless of the placement recorded in the
//! tensor metadata, so these implementations double as the numerical ground truth other
//! kernel sets are compared against.

use std::sync::Arc;

use graphvm::{Error, OperatorRegistry, Result, TensorMeta};
use tracing::debug;

mod discrete;
mod elementwise;
mod matmul;
mod random;
mod reduce;
mod shape;
mod update;

pub use discrete::{ARGMAX, FILL};
pub use elementwise::{ADD, MUL, RELU, SCALE, SUB};
pub use matmul::MATMUL;
pub use random::DROPOUT;
pub use reduce::{MEAN, SUM};
pub use shape::{COPY, RESHAPE};
pub use update::SGD;

/// Registers every reference kernel into `registry`.
///
/// Fails with `DuplicateKind` when one of the kinds is already present; kinds registered
/// before the collision stay registered.
pub fn register_all(registry: &OperatorRegistry) -> Result<()> {
    elementwise::register(registry)?;
    reduce::register(registry)?;
    matmul::register(registry)?;
    shape::register(registry)?;
    random::register(registry)?;
    discrete::register(registry)?;
    update::register(registry)?;
    debug!(kinds = registry.kinds().len(), "registered reference cpu kernels");
    Ok(())
}

/// Fresh registry holding the engine builtins plus every reference kernel.
pub fn registry() -> Result<Arc<OperatorRegistry>> {
    let registry = OperatorRegistry::new();
    register_all(&registry)?;
    Ok(Arc::new(registry))
}

/// Shared shape rule of the elementwise kinds: identical floating-point operands.
pub(crate) fn same_float_meta<'m>(kind: &str, inputs: &'m [TensorMeta]) -> Result<&'m TensorMeta> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::kernel(format!("{kind} needs at least one input")))?;
    if !first.dtype.is_float() {
        return Err(Error::kernel(format!(
            "{kind} does not support dtype {}",
            first.dtype
        )));
    }
    if let Some(other) = inputs.iter().find(|meta| *meta != first) {
        return Err(Error::shape_mismatch(kind, first, other));
    }
    Ok(first)
}
