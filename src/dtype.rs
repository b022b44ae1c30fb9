//! Element types of traced values.

use std::fmt;
use std::str::FromStr;

/// Element type of an array value.
///
/// All element types are stored as `f32` on the host; the dtype decides how
/// values are rounded when produced.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// 32-bit signed integer
    Int32,
    /// Boolean (stored as 0.0 / 1.0)
    Bool,
}

impl DType {
    /// Returns true if this is a floating-point dtype.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    /// Returns true if this is an integer dtype.
    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, DType::Int32)
    }

    /// Promote two dtypes along `bool -> int32 -> float32 -> float64`.
    pub fn promote(lhs: DType, rhs: DType) -> DType {
        let rank = |d: DType| match d {
            DType::Bool => 0,
            DType::Int32 => 1,
            DType::Float32 => 2,
            DType::Float64 => 3,
        };
        if rank(lhs) >= rank(rhs) {
            lhs
        } else {
            rhs
        }
    }

    /// Round an `f32` to the values representable by this dtype.
    #[inline]
    pub fn cast_from_f32(self, value: f32) -> f32 {
        match self {
            DType::Float32 | DType::Float64 => value,
            DType::Int32 => (value as i32) as f32,
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Float32 => "f32",
            DType::Float64 => "f64",
            DType::Int32 => "i32",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::Float32),
            "float64" | "f64" => Ok(DType::Float64),
            "int32" | "i32" => Ok(DType::Int32),
            "bool" => Ok(DType::Bool),
            other => Err(format!("unknown dtype `{}`", other)),
        }
    }
}
