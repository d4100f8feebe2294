use std::sync::Arc;

use crate::error::RuntimeError;
use crate::memory::{registry, AllocatorInfo, AllocatorPtr, Buffer};

use super::{byte_size, element_count, ElementType, Tensor};

mod private {
    pub trait Sealed {}
}

/// Plain-old-data element types that can be viewed in place inside a [`Buffer`].
pub trait Element: private::Sealed + Copy + Send + Sync + 'static {
    const DTYPE: ElementType;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr) => {
        impl private::Sealed for $t {}
        impl Element for $t {
            const DTYPE: ElementType = $dtype;
        }
    };
}

impl_element!(f32, ElementType::F32);
impl_element!(u16, ElementType::F16);
impl_element!(i32, ElementType::I32);
impl_element!(i64, ElementType::I64);
impl_element!(u8, ElementType::U8);

/// Runtime data flowing along a graph edge.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Tensor(TensorValue),
}

impl Value {
    /// Copy a host tensor into a freshly allocated host buffer.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, RuntimeError> {
        let allocator = registry::cpu_allocator();
        let mut value = TensorValue::allocate(&allocator, tensor.dtype(), tensor.shape().to_vec())?;
        value.data_mut()?.copy_from_slice(&tensor.to_bytes());
        Ok(Value::Tensor(value))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Value::Tensor(t) => Some(t),
            Value::Empty => None,
        }
    }

    pub fn as_tensor_mut(&mut self) -> Option<&mut TensorValue> {
        match self {
            Value::Tensor(t) => Some(t),
            Value::Empty => None,
        }
    }

    /// Copy the value back into an owned host tensor.
    pub fn to_tensor(&self) -> Result<Tensor, RuntimeError> {
        match self {
            Value::Tensor(t) => t.to_tensor(),
            Value::Empty => Err(RuntimeError::InvalidArgument(
                "cannot convert an empty value to a tensor".to_string(),
            )),
        }
    }
}

impl From<TensorValue> for Value {
    fn from(value: TensorValue) -> Self {
        Value::Tensor(value)
    }
}

/// Tensor metadata over a shared buffer in some allocator's memory.
#[derive(Debug, Clone)]
pub struct TensorValue {
    dtype: ElementType,
    shape: Vec<usize>,
    buffer: Arc<Buffer>,
}

impl TensorValue {
    /// Bind `buffer` as the storage for a tensor of `dtype` and `shape`.
    pub fn new(
        dtype: ElementType,
        shape: Vec<usize>,
        buffer: Arc<Buffer>,
    ) -> Result<Self, RuntimeError> {
        let needed = byte_size(dtype, &shape)?;
        if buffer.len() < needed {
            return Err(RuntimeError::InvalidArgument(format!(
                "buffer of {} bytes is too small for {} tensor with shape {:?} ({} bytes)",
                buffer.len(),
                dtype,
                shape,
                needed
            )));
        }
        Ok(Self {
            dtype,
            shape,
            buffer,
        })
    }

    /// Allocate a fresh, exclusively owned buffer from `allocator`.
    pub fn allocate(
        allocator: &AllocatorPtr,
        dtype: ElementType,
        shape: Vec<usize>,
    ) -> Result<Self, RuntimeError> {
        let size = byte_size(dtype, &shape)?;
        let buffer = Buffer::allocate(allocator, size)?;
        Ok(Self {
            dtype,
            shape,
            buffer: Arc::new(buffer),
        })
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.n_elements() * self.dtype.size_in_bytes()
    }

    /// Memory location the buffer lives in.
    pub fn location(&self) -> &AllocatorInfo {
        self.buffer.location()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// True when another handle refers to the same buffer.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.buffer) > 1
    }

    /// Raw element bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.byte_size()]
    }

    /// Mutable raw element bytes. Fails when the buffer is shared with another handle.
    pub fn data_mut(&mut self) -> Result<&mut [u8], RuntimeError> {
        let len = self.byte_size();
        let buffer = Arc::get_mut(&mut self.buffer).ok_or_else(|| {
            RuntimeError::InvalidArgument("cannot write to a shared tensor buffer".to_string())
        })?;
        Ok(&mut buffer.as_mut_slice()[..len])
    }

    /// Element count after checking the dtype. Alignment is only checked for non-empty
    /// tensors, since empty buffers carry a dangling pointer.
    fn check_element<T: Element>(&self) -> Result<usize, RuntimeError> {
        if T::DTYPE != self.dtype {
            return Err(RuntimeError::InvalidArgument(format!(
                "tensor holds {} elements, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let n = element_count(&self.shape)?;
        if n > 0 && self.buffer.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "buffer is not aligned for {} access",
                T::DTYPE
            )));
        }
        Ok(n)
    }

    /// View the elements as a typed slice.
    pub fn as_slice<T: Element>(&self) -> Result<&[T], RuntimeError> {
        let n = self.check_element::<T>()?;
        if n == 0 {
            return Ok(&[]);
        }
        // SAFETY: dtype and alignment checked above; `new`/`allocate` guarantee the
        // buffer holds at least `n * size_of::<T>()` bytes.
        Ok(unsafe { std::slice::from_raw_parts(self.buffer.as_ptr() as *const T, n) })
    }

    /// Mutable typed view. Fails when the buffer is shared.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T], RuntimeError> {
        let n = self.check_element::<T>()?;
        if n == 0 {
            return Ok(&mut []);
        }
        let bytes = self.data_mut()?;
        // SAFETY: as for `as_slice`, and the buffer is uniquely borrowed.
        Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, n) })
    }

    pub fn as_f32(&self) -> Result<&[f32], RuntimeError> {
        self.as_slice::<f32>()
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32], RuntimeError> {
        self.as_mut_slice::<f32>()
    }

    /// Copy the elements into an owned host tensor.
    pub fn to_tensor(&self) -> Result<Tensor, RuntimeError> {
        Tensor::from_bytes(self.dtype, self.shape.clone(), self.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from_tensor() {
        let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let v = Value::from_tensor(&t).unwrap();
        let tv = v.as_tensor().unwrap();
        assert_eq!(tv.shape(), &[2, 2]);
        assert_eq!(tv.dtype(), ElementType::F32);
        assert_eq!(tv.location(), &AllocatorInfo::cpu());
        assert_eq!(tv.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(v.to_tensor().unwrap(), t);
    }

    #[test]
    fn test_wrong_element_type() {
        let v = Value::from_tensor(&Tensor::from_i32(vec![2], vec![1, 2])).unwrap();
        let tv = v.as_tensor().unwrap();
        assert!(tv.as_f32().is_err());
        assert_eq!(tv.as_slice::<i32>().unwrap(), &[1, 2]);
    }

    #[test]
    fn test_shared_buffer_is_read_only() {
        let v = Value::from_tensor(&Tensor::zeros(&[3])).unwrap();
        let mut a = v.as_tensor().unwrap().clone();
        assert!(a.is_shared());
        assert!(a.as_f32_mut().is_err());
        drop(v);
        assert!(!a.is_shared());
        a.as_f32_mut().unwrap()[1] = 5.0;
        assert_eq!(a.as_f32().unwrap(), &[0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_empty_tensor_slices() {
        let v = Value::from_tensor(&Tensor::zeros(&[0, 4])).unwrap();
        let tv = v.as_tensor().unwrap();
        assert_eq!(tv.byte_size(), 0);
        assert!(tv.as_f32().unwrap().is_empty());
        let mut owned = tv.clone();
        drop(v);
        assert!(owned.as_f32_mut().unwrap().is_empty());
        assert!(owned.as_slice::<i32>().is_err());
    }

    #[test]
    fn test_empty_value_to_tensor() {
        assert!(Value::Empty.is_empty());
        assert!(Value::Empty.to_tensor().is_err());
    }

    #[test]
    fn test_buffer_too_small() {
        let allocator = registry::cpu_allocator();
        let buffer = Arc::new(Buffer::allocate(&allocator, 8).unwrap());
        let err = TensorValue::new(ElementType::F32, vec![4], buffer).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }
}
