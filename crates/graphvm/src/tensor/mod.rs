//! Core tensor abstractions: dtypes, shapes, placements, typed storage, and the workspace
//! handle type operators borrow by name.

mod device;
pub mod dtype;
mod handle;
pub mod shape;
pub mod storage;
mod value;

pub use device::Device;
pub use dtype::DType;
pub use handle::{BufferId, Tensor};
pub use shape::Shape;
pub use storage::{Element, TensorData};
pub use value::{TensorMeta, TensorValue};

pub(crate) use handle::BufferCell;
