//! Element types, host tensors, and the runtime [`Value`] type.
//!
//! [`Tensor`] is the caller-facing host representation used for feeds, fetches and
//! initializers. [`TensorValue`] is what flows along graph edges at run time: the same
//! metadata over a [`Buffer`](crate::memory::Buffer) living in some allocator's memory.

mod value;

pub use value::{Element, TensorValue, Value};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RuntimeError;

/// Data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F16,
    I32,
    I64,
    U8,
}

impl ElementType {
    /// Size in bytes of one element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::F16 => 2,
            ElementType::I32 => 4,
            ElementType::I64 => 8,
            ElementType::U8 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U8 => "u8",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of elements described by `shape`, failing on `usize` overflow.
pub fn element_count(shape: &[usize]) -> Result<usize, RuntimeError> {
    shape.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "element count of shape {:?} overflows addressable size",
                shape
            ))
        })
    })
}

/// Number of bytes needed to hold a tensor of `dtype` and `shape`.
pub fn byte_size(dtype: ElementType, shape: &[usize]) -> Result<usize, RuntimeError> {
    element_count(shape)?
        .checked_mul(dtype.size_in_bytes())
        .ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "byte size of {} tensor with shape {:?} overflows addressable size",
                dtype, shape
            ))
        })
}

/// Storage for host tensor data, varying by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    F32(Vec<f32>),
    /// 16-bit floating point values stored as raw u16 bits.
    F16(Vec<u16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

/// N-dimensional host tensor with dtype and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: ElementType,
    storage: TensorStorage,
}

fn check_len(kind: &str, len: usize, shape: &[usize]) {
    let n_elements: usize = shape.iter().product();
    assert_eq!(
        len, n_elements,
        "{} data length {} does not match shape {:?} (expected {})",
        kind, len, shape, n_elements
    );
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        check_len("F32", data.len(), &shape);
        debug!(dtype = ?ElementType::F32, ?shape, "Created tensor");
        Self::with_storage(shape, ElementType::F32, TensorStorage::F32(data))
    }

    /// Create a zero-filled F32 tensor.
    pub fn zeros(shape: &[usize]) -> Self {
        let n_elements: usize = shape.iter().product();
        Self::with_storage(
            shape.to_vec(),
            ElementType::F32,
            TensorStorage::F32(vec![0.0f32; n_elements]),
        )
    }

    /// Create an F16 tensor from shape and raw u16 bit data.
    pub fn from_f16(shape: Vec<usize>, data: Vec<u16>) -> Self {
        check_len("F16", data.len(), &shape);
        Self::with_storage(shape, ElementType::F16, TensorStorage::F16(data))
    }

    pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> Self {
        check_len("I32", data.len(), &shape);
        Self::with_storage(shape, ElementType::I32, TensorStorage::I32(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Self {
        check_len("I64", data.len(), &shape);
        Self::with_storage(shape, ElementType::I64, TensorStorage::I64(data))
    }

    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Self {
        check_len("U8", data.len(), &shape);
        Self::with_storage(shape, ElementType::U8, TensorStorage::U8(data))
    }

    /// Build a tensor from little-endian bytes.
    pub fn from_bytes(
        dtype: ElementType,
        shape: Vec<usize>,
        bytes: &[u8],
    ) -> Result<Self, RuntimeError> {
        let expected = byte_size(dtype, &shape)?;
        if bytes.len() != expected {
            return Err(RuntimeError::InvalidArgument(format!(
                "{} tensor with shape {:?} needs {} bytes, got {}",
                dtype,
                shape,
                expected,
                bytes.len()
            )));
        }
        let storage = match dtype {
            ElementType::F32 => TensorStorage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElementType::F16 => TensorStorage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            ElementType::I32 => TensorStorage::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElementType::I64 => TensorStorage::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        i64::from_le_bytes(b)
                    })
                    .collect(),
            ),
            ElementType::U8 => TensorStorage::U8(bytes.to_vec()),
        };
        Ok(Self::with_storage(shape, dtype, storage))
    }

    fn with_storage(shape: Vec<usize>, dtype: ElementType, storage: TensorStorage) -> Self {
        Self {
            shape,
            dtype,
            storage,
        }
    }

    /// Serialize the elements as little-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.storage {
            TensorStorage::F32(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorStorage::F16(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorStorage::I32(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorStorage::I64(d) => d.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorStorage::U8(d) => d.clone(),
        }
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the data type of the tensor.
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    /// Returns the storage of the tensor.
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Returns the total number of elements in the tensor.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total size of the element data in bytes.
    pub fn byte_size(&self) -> usize {
        self.n_elements() * self.dtype.size_in_bytes()
    }

    /// Returns a reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Returns a mutable reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        match &mut self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Convert the tensor to F32.
    ///
    /// F16 values are widened with the `half` crate; integer values are cast.
    pub fn to_f32(&self) -> Tensor {
        let data: Vec<f32> = match &self.storage {
            TensorStorage::F32(_) => return self.clone(),
            TensorStorage::F16(bits) => bits
                .iter()
                .map(|&b| half::f16::from_bits(b).to_f32())
                .collect(),
            TensorStorage::I32(d) => d.iter().map(|&v| v as f32).collect(),
            TensorStorage::I64(d) => d.iter().map(|&v| v as f32).collect(),
            TensorStorage::U8(d) => d.iter().map(|&v| v as f32).collect(),
        };
        Self::with_storage(self.shape.clone(), ElementType::F32, TensorStorage::F32(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_f32_tensor() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), ElementType::F32);
        assert_eq!(t.n_elements(), 6);
        assert_eq!(t.byte_size(), 24);
        assert_eq!(t.as_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "data length")]
    fn test_new_shape_mismatch() {
        Tensor::new(vec![2, 3], vec![1.0, 2.0]);
    }

    #[test]
    fn test_zeros_empty() {
        let t = Tensor::zeros(&[0]);
        assert_eq!(t.n_elements(), 0);
        assert!(t.as_f32().is_empty());
    }

    #[test]
    fn test_f16_to_f32() {
        let one = half::f16::from_f32(1.0).to_bits();
        let half_val = half::f16::from_f32(0.5).to_bits();
        let t = Tensor::from_f16(vec![2], vec![one, half_val]);
        assert_eq!(t.dtype(), ElementType::F16);
        assert_eq!(t.to_f32().as_f32(), &[1.0, 0.5]);
    }

    #[test]
    fn test_bytes_preserve_values() {
        let t = Tensor::from_i64(vec![3], vec![-1, 0, i64::MAX]);
        let bytes = t.to_bytes();
        assert_eq!(bytes.len(), 24);
        let back = Tensor::from_bytes(ElementType::I64, vec![3], &bytes).unwrap();
        assert_eq!(back.storage(), &TensorStorage::I64(vec![-1, 0, i64::MAX]));
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        let result = Tensor::from_bytes(ElementType::F32, vec![2], &[0u8; 7]);
        assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
    }

    #[test]
    fn test_element_count_overflow() {
        let result = element_count(&[usize::MAX, 2]);
        assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
        assert!(byte_size(ElementType::I64, &[usize::MAX / 4]).is_err());
        assert_eq!(byte_size(ElementType::F16, &[3, 5]).unwrap(), 30);
    }

    #[test]
    fn test_scalar_shape_has_one_element() {
        assert_eq!(element_count(&[]).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "not F32")]
    fn test_as_f32_wrong_type() {
        let t = Tensor::from_u8(vec![1], vec![7]);
        t.as_f32();
    }

    #[test]
    fn test_element_type_serde_names() {
        let parsed: ElementType = serde_json::from_str("\"i64\"").unwrap();
        assert_eq!(parsed, ElementType::I64);
        assert_eq!(serde_json::to_string(&ElementType::F16).unwrap(), "\"f16\"");
    }
}
