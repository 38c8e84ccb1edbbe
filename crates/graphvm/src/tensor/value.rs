//! Host-side tensor values exchanged between kernels, feeds, and fetches.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DType, Device, Element, Shape, TensorData};
use crate::error::{Error, Result};

/// Static description of a tensor: everything the scheduler needs to size a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
    pub device: Device,
}

impl TensorMeta {
    pub fn new(shape: impl Into<Shape>, dtype: DType, device: Device) -> Self {
        TensorMeta {
            shape: shape.into(),
            dtype,
            device,
        }
    }

    /// Host-resident metadata, the common case in tests and reference kernels.
    pub fn host(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::new(shape, dtype, Device::Host)
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    /// Buffer size in bytes, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .checked_num_elements()?
            .checked_mul(self.dtype.size_in_bytes())
    }

    pub fn with_shape(&self, shape: impl Into<Shape>) -> Self {
        TensorMeta {
            shape: shape.into(),
            ..self.clone()
        }
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        TensorMeta {
            dtype,
            ..self.clone()
        }
    }

    pub fn with_device(&self, device: Device) -> Self {
        TensorMeta {
            device,
            ..self.clone()
        }
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", self.dtype, self.shape, self.device)
    }
}

/// Owned tensor contents plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    meta: TensorMeta,
    data: TensorData,
}

impl TensorValue {
    /// Pairs metadata with storage, validating element count and kind.
    pub fn new(meta: TensorMeta, data: TensorData) -> Result<Self> {
        if data.dtype() != meta.dtype || data.len() != meta.num_elements() {
            return Err(Error::shape_mismatch(
                "<value>",
                &meta,
                format!("{}[{} elements]", data.dtype(), data.len()),
            ));
        }
        Ok(TensorValue { meta, data })
    }

    /// Constructs a host `F32` tensor from raw values.
    pub fn from_f32(shape: impl Into<Shape>, values: Vec<f32>) -> Result<Self> {
        Self::new(
            TensorMeta::host(shape, DType::F32),
            TensorData::F32(values),
        )
    }

    /// Constructs a host `F64` tensor from raw values.
    pub fn from_f64(shape: impl Into<Shape>, values: Vec<f64>) -> Result<Self> {
        Self::new(
            TensorMeta::host(shape, DType::F64),
            TensorData::F64(values),
        )
    }

    /// Constructs a host `I32` tensor from raw values.
    pub fn from_i32(shape: impl Into<Shape>, values: Vec<i32>) -> Result<Self> {
        Self::new(
            TensorMeta::host(shape, DType::I32),
            TensorData::I32(values),
        )
    }

    pub fn zeros(meta: TensorMeta) -> Self {
        let data = TensorData::zeros(meta.dtype, meta.num_elements());
        TensorValue { meta, data }
    }

    pub fn filled(meta: TensorMeta, value: f64) -> Self {
        let data = TensorData::filled(meta.dtype, meta.num_elements(), value);
        TensorValue { meta, data }
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn shape(&self) -> &Shape {
        &self.meta.shape
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn device(&self) -> Device {
        self.meta.device
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Same contents, different placement.
    pub fn to_device(mut self, device: Device) -> Self {
        self.meta.device = device;
        self
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        self.data.as_slice()
    }

    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        self.data.as_slice::<f32>().map(<[f32]>::to_vec)
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.to_f64_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_mismatch() {
        let err = TensorValue::from_f32([3], vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn scalar_meta_has_one_element() {
        let meta = TensorMeta::host(Shape::scalar(), DType::F64);
        assert_eq!(meta.num_elements(), 1);
        assert_eq!(meta.byte_len(), Some(8));
        assert_eq!(meta.to_string(), "f64[]@host");
    }

    #[test]
    fn byte_len_detects_overflow() {
        let meta = TensorMeta::host([usize::MAX, 2], DType::F32);
        assert_eq!(meta.byte_len(), None);
    }
}
