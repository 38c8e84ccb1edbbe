//! Enumerates the scalar element types a tensor buffer can hold.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical element kind shared between workspace buffers and kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 64-bit floating point.
    F64,
    /// 32-bit signed integer, used for indices and discrete samples.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Raw bytes / booleans.
    U8,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Whether gradients can flow through values of this kind.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Parses the lowercase names accepted in operator configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" => Some(DType::F32),
            "f64" | "float64" => Some(DType::F64),
            "i32" | "int32" => Some(DType::I32),
            "i64" | "int64" => Some(DType::I64),
            "u8" | "uint8" | "bool" => Some(DType::U8),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(DType::parse("Float32"), Some(DType::F32));
        assert_eq!(DType::parse(" int32 "), Some(DType::I32));
        assert_eq!(DType::parse("complex"), None);
    }
}
