use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::memory;
use crate::shape::Shape;

// Tensor — dense f32 array with explicit storage provenance
//
// MEMORY MODEL:
//
//   The data lives in an Arc<Storage>, so cloning a Tensor handle is O(1)
//   and several handles may see the same buffer. Storage is behind a RwLock:
//   many readers (e.g. reference networks running in parallel) can read a
//   parameter at once, and the owning network takes the write lock during a
//   solver step.
//
// PROVENANCE:
//
//   Each handle is tagged Owned or Borrowed. A Borrowed handle is created by
//   `share()` and is how a reference network sees the parameters of its
//   source network: it can read, it can never write. Any mutation through it
//   fails with `Error::BorrowedStorage`, which turns the "references never
//   mutate shared parameters" contract into a checked one.

/// Whether a tensor handle owns its storage or aliases another owner's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The holder of this handle owns the storage and may mutate it.
    Owned,
    /// Read-only alias into storage owned elsewhere.
    Borrowed,
}

/// The raw buffer, registered with the memory accounting on creation.
struct Storage {
    data: RwLock<Vec<f32>>,
    bytes: usize,
}

impl Storage {
    fn new(data: Vec<f32>) -> Self {
        let bytes = data.len() * std::mem::size_of::<f32>();
        memory::track_alloc(bytes);
        Storage {
            data: RwLock::new(data),
            bytes,
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        memory::track_free(self.bytes);
    }
}

/// A dense, row-major `f32` tensor.
///
/// # Example
/// ```
/// use vole_core::{Provenance, Tensor};
///
/// let w = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
/// let alias = w.share();
/// assert_eq!(alias.provenance(), Provenance::Borrowed);
/// assert!(alias.shares_storage_with(&w));
/// assert!(alias.write().is_err());
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    shape: Shape,
    provenance: Provenance,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tensor(shape={}, {:?})", self.shape, self.provenance)
    }
}

impl Tensor {
    // Creation

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.elem_count()];
        Self::owned(data, shape)
    }

    /// Create a tensor from a vec; the length must match the shape.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::owned(data, shape))
    }

    /// Create a tensor whose elements are produced by `f`, in row-major order.
    pub fn from_fn(shape: impl Into<Shape>, f: impl FnMut() -> f32) -> Self {
        let shape = shape.into();
        let data = std::iter::repeat_with(f).take(shape.elem_count()).collect();
        Self::owned(data, shape)
    }

    /// Create a tensor by copying a slice.
    pub fn from_slice(data: &[f32], shape: impl Into<Shape>) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape)
    }

    fn owned(data: Vec<f32>, shape: Shape) -> Self {
        Tensor {
            storage: Arc::new(Storage::new(data)),
            shape,
            provenance: Provenance::Owned,
        }
    }

    // Accessors

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Size of the buffer in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.storage.bytes
    }

    /// Whether this handle owns or borrows its storage.
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Whether both handles point at the same storage.
    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    // Data access

    /// Acquire a read lock on the data.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.storage.data.read()
    }

    /// Acquire a write lock on the data. Fails on a borrowed handle.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<f32>>> {
        match self.provenance {
            Provenance::Owned => Ok(self.storage.data.write()),
            Provenance::Borrowed => Err(Error::BorrowedStorage),
        }
    }

    /// Copy the data out into a new vec.
    pub fn to_vec(&self) -> Vec<f32> {
        self.read().clone()
    }

    /// Overwrite the contents with `data` (same element count).
    pub fn copy_from_slice(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape.clone(),
                expected: self.elem_count(),
                got: data.len(),
            });
        }
        self.write()?.copy_from_slice(data);
        Ok(())
    }

    // Handles

    /// A read-only alias of this tensor's storage.
    pub fn share(&self) -> Tensor {
        Tensor {
            storage: Arc::clone(&self.storage),
            shape: self.shape.clone(),
            provenance: Provenance::Borrowed,
        }
    }

    /// An owned copy with freshly allocated storage.
    pub fn deep_copy(&self) -> Tensor {
        Self::owned(self.to_vec(), self.shape.clone())
    }

    /// A view of the same storage with a different shape.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape,
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            shape,
            provenance: self.provenance,
        })
    }

    /// Exact element-wise and shape equality (bitwise on the floats).
    pub fn bitwise_eq(&self, other: &Tensor) -> bool {
        if self.shape != other.shape {
            return false;
        }
        if self.shares_storage_with(other) {
            return true;
        }
        let a = self.read();
        let b = other.read();
        a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_count() {
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], (2, 2)).is_err());
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
        assert_eq!(t.size_in_bytes(), 16);
    }

    #[test]
    fn test_share_is_read_only_alias() {
        let t = Tensor::zeros((3,));
        let alias = t.share();
        assert!(alias.shares_storage_with(&t));
        assert!(matches!(alias.write(), Err(Error::BorrowedStorage)));

        t.copy_from_slice(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(alias.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_shared_alias_of_alias_stays_borrowed() {
        let t = Tensor::zeros((2,));
        let a = t.share();
        let b = a.share();
        assert_eq!(b.provenance(), Provenance::Borrowed);
        assert!(b.shares_storage_with(&t));
        // Cloning a borrowed handle never upgrades it.
        assert_eq!(b.clone().provenance(), Provenance::Borrowed);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let t = Tensor::from_vec(vec![1.0, 2.0], (2,)).unwrap();
        let shared = t.share();
        let c = shared.deep_copy();
        assert_eq!(c.provenance(), Provenance::Owned);
        assert!(!c.shares_storage_with(&t));
        c.copy_from_slice(&[5.0, 6.0]).unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_reshape_keeps_storage() {
        let t = Tensor::zeros((2, 3));
        let r = t.reshape((6,)).unwrap();
        assert!(r.shares_storage_with(&t));
        assert!(t.reshape((4,)).is_err());
    }

    #[test]
    fn test_bitwise_eq() {
        let a = Tensor::from_vec(vec![0.1, 0.2], (2,)).unwrap();
        let b = Tensor::from_vec(vec![0.1, 0.2], (2,)).unwrap();
        let c = Tensor::from_vec(vec![0.1, 0.3], (2,)).unwrap();
        assert!(a.bitwise_eq(&b));
        assert!(!a.bitwise_eq(&c));
        assert!(!a.bitwise_eq(&a.reshape((1, 2)).unwrap()));
    }
}
