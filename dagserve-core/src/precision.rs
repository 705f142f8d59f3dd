//! Tensor element precision.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor.
///
/// The discriminants are part of the custom-node ABI: libraries tag their
/// outputs with these exact values, so the enum is `#[repr(i32)]` and must
/// never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Precision {
    /// Unknown element type. Carries no size; rejected everywhere a
    /// concrete precision is required.
    Unspecified = 0,
    /// 32-bit IEEE float.
    Fp32 = 1,
    /// 16-bit IEEE float.
    Fp16 = 2,
    /// Unsigned 8-bit integer.
    U8 = 3,
    /// Signed 8-bit integer.
    I8 = 4,
    /// Signed 16-bit integer.
    I16 = 5,
    /// Signed 32-bit integer.
    I32 = 6,
    /// Signed 64-bit integer.
    I64 = 7,
}

impl Precision {
    /// Size of one element in bytes, or `None` for [`Precision::Unspecified`].
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::Unspecified => None,
            Self::Fp32 | Self::I32 => Some(4),
            Self::Fp16 | Self::I16 => Some(2),
            Self::U8 | Self::I8 => Some(1),
            Self::I64 => Some(8),
        }
    }

    /// Decode an ABI precision tag.
    ///
    /// Returns `None` for values outside the enum, which callers surface as
    /// `NODE_LIBRARY_INVALID_PRECISION`.
    #[must_use]
    pub fn from_abi(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unspecified),
            1 => Some(Self::Fp32),
            2 => Some(Self::Fp16),
            3 => Some(Self::U8),
            4 => Some(Self::I8),
            5 => Some(Self::I16),
            6 => Some(Self::I32),
            7 => Some(Self::I64),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Fp32 => "FP32",
            Self::Fp16 => "FP16",
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::I16 => "I16",
            Self::I32 => "I32",
            Self::I64 => "I64",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_sizes() {
        assert_eq!(Precision::Fp32.size(), Some(4));
        assert_eq!(Precision::Fp16.size(), Some(2));
        assert_eq!(Precision::I64.size(), Some(8));
        assert_eq!(Precision::U8.size(), Some(1));
        assert_eq!(Precision::Unspecified.size(), None);
    }

    #[test]
    fn abi_roundtrip() {
        for precision in [
            Precision::Unspecified,
            Precision::Fp32,
            Precision::Fp16,
            Precision::U8,
            Precision::I8,
            Precision::I16,
            Precision::I32,
            Precision::I64,
        ] {
            assert_eq!(Precision::from_abi(precision as i32), Some(precision));
        }
    }

    #[test]
    fn abi_rejects_unknown_tags() {
        assert_eq!(Precision::from_abi(-1), None);
        assert_eq!(Precision::from_abi(42), None);
    }
}
