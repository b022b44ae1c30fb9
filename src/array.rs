//! Concrete host values consumed and produced by evaluation.

use crate::{DType, Shape};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Global counter for generating unique array IDs
static ARRAY_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_array_id() -> usize {
    ARRAY_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A dense, immutable, row-major array held on the host.
///
/// Cloning an `Array` is cheap and keeps its [`id`](Array::id): clones are the
/// same value as far as constant deduplication and residual forwarding are
/// concerned. Equality and hashing compare contents bit for bit.
///
/// # Examples
///
/// ```
/// # use jaxpr_rs::{Array, DType};
/// let a = Array::from_vec(vec![1.0, 2.0, 3.0], vec![3]);
/// assert_eq!(a.dims(), &[3]);
/// assert_eq!(a.dtype(), DType::Float32);
/// assert_eq!(a.clone().id(), a.id());
/// ```
#[derive(Clone)]
pub struct Array {
    data: Arc<Vec<f32>>,
    dims: Vec<usize>,
    dtype: DType,
    id: usize,
}

impl Array {
    /// Create a `Float32` array from row-major data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not match the product of `dims`.
    pub fn from_vec(data: Vec<f32>, dims: Vec<usize>) -> Self {
        Self::from_vec_typed(data, dims, DType::Float32)
    }

    /// Create an array of the given dtype, rounding every element to it.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not match the product of `dims`.
    pub fn from_vec_typed(data: Vec<f32>, dims: Vec<usize>, dtype: DType) -> Self {
        let size: usize = dims.iter().product();
        assert_eq!(
            data.len(),
            size,
            "data length {} does not match dims {:?}",
            data.len(),
            dims
        );
        let data = data.into_iter().map(|x| dtype.cast_from_f32(x)).collect();
        Self { data: Arc::new(data), dims, dtype, id: next_array_id() }
    }

    /// Create a rank-0 array.
    pub fn scalar(value: f32, dtype: DType) -> Self {
        Self::from_vec_typed(vec![value], Vec::new(), dtype)
    }

    /// Create an array filled with `value`.
    pub fn full(value: f32, dims: Vec<usize>, dtype: DType) -> Self {
        let size = dims.iter().product();
        Self::from_vec_typed(vec![value; size], dims, dtype)
    }

    /// Create an array filled with zeros.
    pub fn zeros(dims: Vec<usize>, dtype: DType) -> Self {
        Self::full(0.0, dims, dtype)
    }

    /// Get the dimensions of the array.
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Get the shape of the array.
    pub fn shape(&self) -> Shape {
        Shape::new(self.dims.clone())
    }

    /// Get the data type of the array.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Get the total number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the unique ID of this array.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Check if this is a scalar (0-dimensional array).
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Borrow the row-major elements.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Copy the elements into a new vector.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }

    /// The single element of a one-element array.
    pub fn item(&self) -> Option<f32> {
        match self.data.as_slice() {
            [x] => Some(*x),
            _ => None,
        }
    }

    /// Apply `f` to every element, producing an array of `dtype`.
    pub fn map(&self, dtype: DType, f: impl Fn(f32) -> f32) -> Array {
        let data = self.data.iter().map(|&x| f(x)).collect();
        Array::from_vec_typed(data, self.dims.clone(), dtype)
    }

    /// Combine two arrays elementwise with NumPy broadcasting.
    ///
    /// Returns `None` if the dimensions are not broadcast-compatible.
    pub fn zip_with(&self, other: &Array, dtype: DType, f: impl Fn(f32, f32) -> f32) -> Option<Array> {
        let out = self.shape().broadcast_with(&other.shape())?.static_dims()?;
        let size: usize = out.iter().product();
        let data = (0..size)
            .map(|flat| {
                let lhs = self.data[source_index(flat, &out, &self.dims)];
                let rhs = other.data[source_index(flat, &out, &other.dims)];
                f(lhs, rhs)
            })
            .collect();
        Some(Array::from_vec_typed(data, out, dtype))
    }

    /// Convert to another dtype.
    pub fn astype(&self, dtype: DType) -> Array {
        self.map(dtype, |x| x)
    }
}

/// Position in a (possibly broadcast) source of the element at `flat` in `out`.
fn source_index(flat: usize, out: &[usize], src: &[usize]) -> usize {
    let offset = out.len() - src.len();
    let mut rem = flat;
    let mut index = 0;
    let mut stride = 1;
    for k in (0..out.len()).rev() {
        let coord = rem % out[k];
        rem /= out[k];
        if k >= offset {
            let extent = src[k - offset];
            if extent != 1 {
                index += coord * stride;
            }
            stride *= extent;
        }
    }
    index
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.dims == other.dims
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for Array {}

impl Hash for Array {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dtype.hash(state);
        self.dims.hash(state);
        for x in self.data.iter() {
            x.to_bits().hash(state);
        }
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.size() <= 8 {
            write!(f, "Array({}{} {:?})", self.dtype, self.shape(), self.data)
        } else {
            write!(f, "Array({}{} #{})", self.dtype, self.shape(), self.id)
        }
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array:{}{}", self.dtype, self.shape())
    }
}

/// A shared mutable cell holding an array.
///
/// All clones alias the same storage; identity is the storage address.
#[derive(Clone)]
pub struct ArrayRef {
    cell: Arc<Mutex<Array>>,
}

impl ArrayRef {
    /// Allocate a new cell initialized to `init`.
    pub fn new(init: Array) -> Self {
        Self { cell: Arc::new(Mutex::new(init)) }
    }

    fn lock(&self) -> MutexGuard<'_, Array> {
        // Arrays are immutable, so a poisoned lock still holds a valid value.
        self.cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the current contents.
    pub fn get(&self) -> Array {
        self.lock().clone()
    }

    /// Replace the contents.
    pub fn set(&self, value: Array) {
        *self.lock() = value;
    }

    /// Identity of the underlying storage.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:?})", *self.lock())
    }
}

/// A concrete value: either an immutable array or a mutable reference cell.
#[derive(Debug, Clone)]
pub enum Value {
    /// Immutable array.
    Array(Array),
    /// Mutable array cell.
    Ref(ArrayRef),
}

impl Value {
    /// Identity used to deduplicate constants and forward residuals.
    pub fn id(&self) -> usize {
        match self {
            Value::Array(a) => a.id(),
            Value::Ref(r) => r.id(),
        }
    }

    /// The array payload, if this is not a reference.
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            Value::Ref(_) => None,
        }
    }

    /// The reference payload, if this is a reference.
    pub fn as_array_ref(&self) -> Option<&ArrayRef> {
        match self {
            Value::Ref(r) => Some(r),
            Value::Array(_) => None,
        }
    }

    /// Returns true if both values are the same object.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a.id() == b.id(),
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(&a.cell, &b.cell),
            _ => false,
        }
    }
}

impl From<Array> for Value {
    fn from(array: Array) -> Self {
        Value::Array(array)
    }
}

impl From<ArrayRef> for Value {
    fn from(cell: ArrayRef) -> Self {
        Value::Ref(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_full() {
        let a = Array::full(5.0, vec![2, 2], DType::Float32);
        assert_eq!(a.to_vec(), vec![5.0, 5.0, 5.0, 5.0]);
        assert_eq!(a.ndim(), 2);
        assert_eq!(a.size(), 4);
    }

    #[test]
    fn test_array_typed_rounding() {
        let a = Array::from_vec_typed(vec![1.7, -2.2], vec![2], DType::Int32);
        assert_eq!(a.to_vec(), vec![1.0, -2.0]);
        let b = a.astype(DType::Bool);
        assert_eq!(b.to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_identity_and_equality() {
        let a = Array::from_vec(vec![1.0, 2.0], vec![2]);
        let b = Array::from_vec(vec![1.0, 2.0], vec![2]);
        assert_eq!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert!(Value::from(a.clone()).is_same(&Value::from(a)));
    }

    #[test]
    fn test_zip_with_broadcast() {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let b = Array::from_vec(vec![10.0, 20.0, 30.0], vec![3]);
        let c = a.zip_with(&b, DType::Float32, |x, y| x + y).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        let s = Array::scalar(2.0, DType::Float32);
        let d = s.zip_with(&a, DType::Float32, |x, y| x * y).unwrap();
        assert_eq!(d.to_vec(), vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);

        let bad = Array::from_vec(vec![1.0, 2.0], vec![2]);
        assert!(a.zip_with(&bad, DType::Float32, |x, y| x + y).is_none());
    }

    #[test]
    fn test_array_ref_aliasing() {
        let cell = ArrayRef::new(Array::zeros(vec![2], DType::Float32));
        let alias = cell.clone();
        alias.set(Array::from_vec(vec![3.0, 4.0], vec![2]));
        assert_eq!(cell.get().to_vec(), vec![3.0, 4.0]);
        assert_eq!(cell.id(), alias.id());
        assert!(Value::from(cell).is_same(&Value::from(alias)));
    }

    #[test]
    fn test_array_display() {
        let a = Array::zeros(vec![2, 3], DType::Float32);
        assert_eq!(a.to_string(), "Array:f32(2, 3)");
    }
}
