use serde::{Deserialize, Serialize};

use crate::tensor::{DType, Shape};

/// Device-independent copy of a tensor for checkpoint layers: name, shape, dtype, raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSnapshot {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    pub bytes: Vec<u8>,
}
