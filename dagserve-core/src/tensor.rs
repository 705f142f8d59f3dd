//! The tensor value carried along pipeline edges.

use crate::error::{PipelineError, Result};
use crate::precision::Precision;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// Named tensors, as exchanged in requests, responses and between nodes.
pub type TensorMap = HashMap<String, Tensor>;

/// An immutable tensor: element precision, dimension vector and a contiguous
/// byte buffer.
///
/// Invariant, enforced at construction: the shape is non-empty, every
/// dimension is at least one, the precision is concrete, and the buffer
/// length equals the product of the dimensions times the element size.
///
/// The buffer is a [`Bytes`] handle, so cloning a tensor, slicing a shard out
/// of it, or sharing it across demultiplexed sub-executions never copies
/// data. Buffers produced by a custom-node library stay owned by that
/// library; the `Bytes` owner releases them through the library exactly once
/// when the last handle drops.
#[derive(Debug, Clone)]
pub struct Tensor {
    precision: Precision,
    shape: Vec<u64>,
    data: Bytes,
}

impl Tensor {
    /// Create a tensor, checking the shape/precision/byte-length invariant.
    pub fn new(precision: Precision, shape: Vec<u64>, data: Bytes) -> Result<Self> {
        let element_size = precision.size().ok_or_else(|| PipelineError::InvalidTensor {
            cause: "precision is unspecified".to_string(),
        })?;
        if shape.is_empty() {
            return Err(PipelineError::InvalidTensor {
                cause: "shape is empty".to_string(),
            });
        }
        if shape.iter().any(|&dim| dim == 0) {
            return Err(PipelineError::InvalidTensor {
                cause: format!("shape {:?} contains a zero dimension", shape),
            });
        }
        let elements = shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| PipelineError::InvalidTensor {
                cause: format!("shape {:?} overflows the element count", shape),
            })?;
        let expected = elements as usize * element_size;
        if data.len() != expected {
            return Err(PipelineError::InvalidTensor {
                cause: format!(
                    "buffer holds {} bytes, shape {:?} with precision {} requires {}",
                    data.len(),
                    shape,
                    precision,
                    expected
                ),
            });
        }
        Ok(Self {
            precision,
            shape,
            data,
        })
    }

    /// Create an FP32 tensor from a slice of values.
    pub fn from_f32(shape: Vec<u64>, values: &[f32]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for value in values {
            buf.extend_from_slice(&value.to_ne_bytes());
        }
        Self::new(Precision::Fp32, shape, buf.freeze())
    }

    /// Element precision.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Dimension vector.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The underlying byte buffer.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Buffer length in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Total element count.
    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Read the buffer as FP32 values.
    pub fn as_f32(&self) -> Result<Vec<f32>> {
        if self.precision != Precision::Fp32 {
            return Err(PipelineError::InvalidTensor {
                cause: format!("expected FP32 data, tensor is {}", self.precision),
            });
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Slice shard `index` off the leading axis, dropping that axis.
    ///
    /// Zero-copy: the shard shares the parent buffer. The tensor must have
    /// at least two dimensions, otherwise a shard would have an empty shape.
    pub fn shard(&self, index: u64) -> Result<Self> {
        if self.shape.len() < 2 {
            return Err(PipelineError::InvalidTensor {
                cause: format!(
                    "cannot shard a tensor of shape {:?}: at least two dimensions required",
                    self.shape
                ),
            });
        }
        let count = self.shape[0];
        if index >= count {
            return Err(PipelineError::InvalidTensor {
                cause: format!("shard index {} out of range for leading dimension {}", index, count),
            });
        }
        let stride = self.byte_len() / count as usize;
        let start = index as usize * stride;
        Ok(Self {
            precision: self.precision,
            shape: self.shape[1..].to_vec(),
            data: self.data.slice(start..start + stride),
        })
    }

    /// Stack tensors along a new leading axis.
    ///
    /// All parts must agree in shape and precision; the result has shape
    /// `[parts.len(), ...]`. This is the gather-side concatenation, so it
    /// necessarily copies each part into one contiguous buffer.
    pub fn stack(parts: &[Tensor]) -> Result<Self> {
        let first = parts.first().ok_or_else(|| PipelineError::InvalidTensor {
            cause: "cannot stack zero tensors".to_string(),
        })?;
        let mut buf = BytesMut::with_capacity(first.byte_len() * parts.len());
        for part in parts {
            if part.shape != first.shape || part.precision != first.precision {
                return Err(PipelineError::InvalidTensor {
                    cause: format!(
                        "cannot stack {} {:?} with {} {:?}",
                        first.precision, first.shape, part.precision, part.shape
                    ),
                });
            }
            buf.extend_from_slice(&part.data);
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(parts.len() as u64);
        shape.extend_from_slice(&first.shape);
        Self::new(first.precision, shape, buf.freeze())
    }

    /// Copy the tensor into a fresh engine-owned buffer.
    ///
    /// Used at the exit node so that library-owned memory can be released
    /// before the response reaches the caller.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            precision: self.precision,
            shape: self.shape.clone(),
            data: Bytes::copy_from_slice(&self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_checks_byte_length() {
        let ok = Tensor::new(Precision::Fp32, vec![2, 3], Bytes::from(vec![0u8; 24]));
        assert!(ok.is_ok());

        let short = Tensor::new(Precision::Fp32, vec![2, 3], Bytes::from(vec![0u8; 20]));
        assert!(matches!(short, Err(PipelineError::InvalidTensor { .. })));
    }

    #[test]
    fn construction_rejects_bad_shapes() {
        let empty = Tensor::new(Precision::Fp32, vec![], Bytes::new());
        assert!(empty.is_err());

        let zero_dim = Tensor::new(Precision::Fp32, vec![1, 0], Bytes::new());
        assert!(zero_dim.is_err());

        let unspecified = Tensor::new(Precision::Unspecified, vec![1], Bytes::from(vec![0u8; 4]));
        assert!(unspecified.is_err());
    }

    #[test]
    fn f32_roundtrip() {
        let tensor = Tensor::from_f32(vec![1, 3], &[3.2, 5.7, -2.4]).unwrap();
        assert_eq!(tensor.precision(), Precision::Fp32);
        assert_eq!(tensor.byte_len(), 12);
        assert_eq!(tensor.as_f32().unwrap(), vec![3.2, 5.7, -2.4]);
    }

    #[test]
    fn shard_is_zero_copy_slice() {
        let tensor = Tensor::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let second = tensor.shard(1).unwrap();
        assert_eq!(second.shape(), &[3]);
        assert_eq!(second.as_f32().unwrap(), vec![4.0, 5.0, 6.0]);
        // Same backing allocation, offset by one row.
        assert_eq!(
            second.data().as_ptr() as usize,
            tensor.data().as_ptr() as usize + 12
        );
    }

    #[test]
    fn shard_bounds_and_rank_checks() {
        let tensor = Tensor::from_f32(vec![2, 3], &[0.0; 6]).unwrap();
        assert!(tensor.shard(2).is_err());

        let flat = Tensor::from_f32(vec![3], &[0.0; 3]).unwrap();
        assert!(flat.shard(0).is_err());
    }

    #[test]
    fn stack_reintroduces_leading_axis() {
        let a = Tensor::from_f32(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_f32(vec![3], &[4.0, 5.0, 6.0]).unwrap();
        let stacked = Tensor::stack(&[a, b]).unwrap();
        assert_eq!(stacked.shape(), &[2, 3]);
        assert_eq!(
            stacked.as_f32().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn stack_rejects_mismatched_parts() {
        let a = Tensor::from_f32(vec![3], &[0.0; 3]).unwrap();
        let b = Tensor::from_f32(vec![2], &[0.0; 2]).unwrap();
        assert!(Tensor::stack(&[a, b]).is_err());
        assert!(Tensor::stack(&[]).is_err());
    }

    #[test]
    fn shard_then_stack_roundtrip() {
        let tensor = Tensor::from_f32(vec![4, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).unwrap();
        let shards: Vec<Tensor> = (0..4).map(|i| tensor.shard(i).unwrap()).collect();
        let rebuilt = Tensor::stack(&shards).unwrap();
        assert_eq!(rebuilt.shape(), tensor.shape());
        assert_eq!(rebuilt.as_f32().unwrap(), tensor.as_f32().unwrap());
    }
}
