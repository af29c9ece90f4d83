//! Core `Array` type: an eagerly evaluated tensor backed by a device slot.

use crate::backend::{default_backend, Backend, Slot};
use crate::error::{Error, Result};
use crate::{AbstractValue, DType, Scalar, Shape};
use std::fmt;
use std::sync::Arc;

/// A multidimensional array on a device.
///
/// An `Array` owns one reference to a refcounted backend slot: cloning
/// increments the slot's refcount and dropping decrements it, so device
/// memory follows Rust ownership.
///
/// # Examples
///
/// ```
/// # use microjax::{Array, DType, Shape};
/// let a = Array::zeros(Shape::new(vec![2, 3]), DType::Float32);
/// assert_eq!(a.shape().as_slice(), &[2, 3]);
/// ```
pub struct Array {
    slot: Slot,
    aval: AbstractValue,
    backend: Arc<dyn Backend>,
}

impl Array {
    /// Wrap an existing slot, taking ownership of one reference.
    pub(crate) fn from_parts(
        slot: Slot,
        aval: AbstractValue,
        backend: Arc<dyn Backend>,
    ) -> Array {
        Array { slot, aval, backend }
    }

    /// Wrap an externally allocated slot, taking ownership of one of its
    /// references. The caller warrants that `aval` matches the slot's size.
    pub fn adopt(slot: Slot, aval: AbstractValue, backend: Arc<dyn Backend>) -> Array {
        Array { slot, aval, backend }
    }

    /// Create an array from raw little-endian bytes on the default backend.
    pub fn from_bytes(bytes: &[u8], aval: AbstractValue) -> Result<Array> {
        let backend = default_backend();
        if bytes.len() != aval.byte_size() {
            return Err(Error::Type(format!(
                "{} bytes cannot initialize {}",
                bytes.len(),
                aval
            )));
        }
        let slot = backend.malloc(bytes.len(), Some(bytes))?;
        Ok(Array { slot, aval, backend })
    }

    /// Create a float32 array from host data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not match the shape's size.
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Array {
        assert_eq!(data.len(), shape.size(), "data length does not match shape");
        let aval = AbstractValue::new(shape, DType::Float32);
        Array::from_bytes(bytemuck::cast_slice(&data), aval)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Create a uint32 array from host data.
    pub fn from_u32_vec(data: Vec<u32>, shape: Shape) -> Array {
        assert_eq!(data.len(), shape.size(), "data length does not match shape");
        let aval = AbstractValue::new(shape, DType::Uint32);
        Array::from_bytes(bytemuck::cast_slice(&data), aval)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    /// Create a scalar array holding one value.
    pub fn scalar(value: Scalar) -> Array {
        let aval = AbstractValue::scalar(value.dtype());
        let mut bytes = Vec::with_capacity(aval.byte_size());
        crate::backend::cpu::write_scalar(&mut bytes, value);
        Array::from_bytes(&bytes, aval).unwrap_or_else(|e| panic!("{}", e))
    }

    /// Array of zeros.
    pub fn zeros(shape: Shape, dtype: DType) -> Array {
        let aval = AbstractValue::new(shape, dtype);
        let bytes = vec![0u8; aval.byte_size()];
        Array::from_bytes(&bytes, aval).unwrap_or_else(|e| panic!("{}", e))
    }

    /// Array filled with one value.
    pub fn full(shape: Shape, value: Scalar) -> Array {
        let aval = AbstractValue::new(shape, value.dtype());
        let mut bytes = Vec::with_capacity(aval.byte_size());
        for _ in 0..aval.size() {
            crate::backend::cpu::write_scalar(&mut bytes, value);
        }
        Array::from_bytes(&bytes, aval).unwrap_or_else(|e| panic!("{}", e))
    }

    /// The abstract value of this array.
    pub fn aval(&self) -> &AbstractValue {
        &self.aval
    }

    /// The shape.
    pub fn shape(&self) -> &Shape {
        &self.aval.shape
    }

    /// The element dtype.
    pub fn dtype(&self) -> DType {
        self.aval.dtype
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.aval.size()
    }

    /// True for zero-dimensional arrays.
    pub fn is_scalar(&self) -> bool {
        self.aval.shape.is_scalar()
    }

    /// The device slot backing this array.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// The backend holding the slot.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Read the raw bytes back to the host, blocking on the device.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.backend.read_sync(self.slot, 0, Some(self.aval.byte_size()))
    }

    /// Read a float32 array back to the host.
    ///
    /// # Panics
    ///
    /// Panics if the dtype is not float32 or the device read fails.
    pub fn to_vec(&self) -> Vec<f32> {
        assert_eq!(self.dtype(), DType::Float32, "to_vec on non-float array");
        let bytes = self.to_bytes().unwrap_or_else(|e| panic!("{}", e));
        bytemuck::cast_slice(&bytes).to_vec()
    }

    /// Read a uint32 array back to the host.
    pub fn to_u32_vec(&self) -> Vec<u32> {
        assert_eq!(self.dtype(), DType::Uint32, "to_u32_vec on non-uint32 array");
        let bytes = self.to_bytes().unwrap_or_else(|e| panic!("{}", e));
        bytemuck::cast_slice(&bytes).to_vec()
    }

    /// Read one element as a scalar.
    pub fn item(&self) -> Scalar {
        assert_eq!(self.size(), 1, "item() on array of size {}", self.size());
        let bytes = self.to_bytes().unwrap_or_else(|e| panic!("{}", e));
        crate::backend::cpu::read_scalar(&bytes, 0, self.dtype())
    }

    /// Read one element as f32.
    pub fn item_f32(&self) -> f32 {
        match self.item() {
            Scalar::F32(v) => v,
            other => panic!("item_f32 on {} array", other.dtype()),
        }
    }
}

impl Clone for Array {
    fn clone(&self) -> Self {
        self.backend
            .inc_ref(self.slot)
            .unwrap_or_else(|e| panic!("clone of dead array: {}", e));
        Array { slot: self.slot, aval: self.aval.clone(), backend: self.backend.clone() }
    }
}

impl Drop for Array {
    fn drop(&mut self) {
        // The slot may legitimately outlive backend errors during teardown.
        let _ = self.backend.dec_ref(self.slot);
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array({}, slot={})", self.aval, self.slot.0)
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.aval)
    }
}
