//! Typed host storage backing every workspace buffer, plus the scalar element trait kernels
//! are written against.

use std::ops::{Add, Div, Mul, Neg, Sub};

use bytemuck::allocation::pod_collect_to_vec;

use super::DType;
use crate::error::{Error, Result};

/// Dense, contiguous element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Zero-initialised storage of `len` elements.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
            DType::I32 => TensorData::I32(vec![0; len]),
            DType::I64 => TensorData::I64(vec![0; len]),
            DType::U8 => TensorData::U8(vec![0; len]),
        }
    }

    /// Storage of `len` elements all equal to `value` (truncated for integer kinds).
    pub fn filled(dtype: DType, len: usize, value: f64) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![value as f32; len]),
            DType::F64 => TensorData::F64(vec![value; len]),
            DType::I32 => TensorData::I32(vec![value as i32; len]),
            DType::I64 => TensorData::I64(vec![value as i64; len]),
            DType::U8 => TensorData::U8(vec![value as u8; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::U8(_) => DType::U8,
        }
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Little-endian byte view of the storage.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TensorData::F32(v) => bytemuck::cast_slice(v),
            TensorData::F64(v) => bytemuck::cast_slice(v),
            TensorData::I32(v) => bytemuck::cast_slice(v),
            TensorData::I64(v) => bytemuck::cast_slice(v),
            TensorData::U8(v) => v,
        }
    }

    /// Rebuilds typed storage from raw bytes, validating the length against the dtype.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(Error::kernel(format!(
                "{} bytes cannot be reinterpreted as {dtype}",
                bytes.len()
            )));
        }
        Ok(match dtype {
            DType::F32 => TensorData::F32(pod_collect_to_vec(bytes)),
            DType::F64 => TensorData::F64(pod_collect_to_vec(bytes)),
            DType::I32 => TensorData::I32(pod_collect_to_vec(bytes)),
            DType::I64 => TensorData::I64(pod_collect_to_vec(bytes)),
            DType::U8 => TensorData::U8(bytes.to_vec()),
        })
    }

    /// Typed slice access, or `None` when the element kind differs.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Lossy conversion into `f64` values, used by tests and diagnostics.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            TensorData::F32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            TensorData::F64(v) => v.clone(),
            TensorData::I32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            TensorData::I64(v) => v.iter().map(|x| *x as f64).collect(),
            TensorData::U8(v) => v.iter().map(|x| f64::from(*x)).collect(),
        }
    }
}

/// Trait describing numeric behaviour required by floating-point kernels.
///
/// Implementations provide zero/one constructors and conversions so reference kernels can run
/// generically over the element type.
pub trait Element:
    Copy
    + Default
    + PartialOrd
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    const DTYPE: DType;

    fn zero() -> Self;
    fn one() -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    /// Borrows the typed slice when `data` holds this element kind.
    fn slice(data: &TensorData) -> Option<&[Self]>;

    /// Wraps a typed vector back into storage.
    fn wrap(values: Vec<Self>) -> TensorData;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::F32(values)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F64(v) => Some(v),
            _ => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::F64(values)
    }
}

/// Runs `$body` with `$t` aliased to the [`Element`] type matching a floating-point dtype.
///
/// Non-float dtypes produce an [`Error::Kernel`](crate::Error::Kernel) naming `$kind`.
#[macro_export]
macro_rules! dispatch_float {
    ($dtype:expr, $kind:expr, |$t:ident| $body:expr) => {
        match $dtype {
            $crate::tensor::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::tensor::DType::F64 => {
                type $t = f64;
                $body
            }
            other => Err($crate::Error::kernel(format!(
                "{} does not support dtype {}",
                $kind, other
            ))),
        }
    };
}
