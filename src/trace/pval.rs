//! Abstract values and partial values.
//!
//! An [`AbstractValue`] describes a value without its contents. A
//! [`PartialVal`] is what partial evaluation threads around: either a concrete
//! value known while tracing or an abstract value to be computed later.

use crate::trace::Var;
use crate::{Array, DType, Dim, Error, Result, Shape, Value};
use std::fmt;

/// Shape and dtype of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapedArray {
    /// Shape, possibly with dynamic dimensions.
    pub shape: Shape,
    /// Element type.
    pub dtype: DType,
}

/// Type of a value flowing through a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbstractValue {
    /// An immutable array.
    Array(ShapedArray),
    /// A mutable reference to an array.
    Ref(ShapedArray),
}

impl AbstractValue {
    /// Abstract array of the given shape and dtype.
    pub fn array(shape: impl Into<Shape>, dtype: DType) -> Self {
        AbstractValue::Array(ShapedArray { shape: shape.into(), dtype })
    }

    /// Rank-0 abstract array.
    pub fn scalar(dtype: DType) -> Self {
        Self::array(Shape::scalar(), dtype)
    }

    /// Abstract mutable reference to an array of the given shape and dtype.
    pub fn reference(shape: impl Into<Shape>, dtype: DType) -> Self {
        AbstractValue::Ref(ShapedArray { shape: shape.into(), dtype })
    }

    /// Abstraction of a concrete value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Array(a) => Self::of_array(a),
            Value::Ref(r) => {
                let current = r.get();
                Self::reference(current.shape(), current.dtype())
            }
        }
    }

    /// Abstraction of a concrete array.
    pub fn of_array(array: &Array) -> Self {
        Self::array(array.shape(), array.dtype())
    }

    /// The underlying shaped array.
    pub fn inner(&self) -> &ShapedArray {
        match self {
            AbstractValue::Array(s) | AbstractValue::Ref(s) => s,
        }
    }

    /// Shape of the (referenced) array.
    pub fn shape(&self) -> &Shape {
        &self.inner().shape
    }

    /// Element type of the (referenced) array.
    pub fn dtype(&self) -> DType {
        self.inner().dtype
    }

    /// Returns true for mutable references.
    pub fn is_ref(&self) -> bool {
        matches!(self, AbstractValue::Ref(_))
    }

    /// Returns true for rank-0 arrays.
    pub fn is_scalar(&self) -> bool {
        !self.is_ref() && self.shape().is_scalar()
    }

    /// The array type a reference points to; arrays are returned unchanged.
    pub fn deref(&self) -> AbstractValue {
        AbstractValue::Array(self.inner().clone())
    }

    /// Variables referenced by dynamic dimensions.
    pub fn dim_vars(&self) -> impl Iterator<Item = &Var> {
        self.shape().dynamic_vars()
    }

    /// Rewrite dynamic dimensions through `f`, keeping the reference-ness.
    pub fn map_dims(&self, f: impl FnMut(&Var) -> Dim) -> AbstractValue {
        let inner = ShapedArray { shape: self.shape().map_dynamic(f), dtype: self.dtype() };
        match self {
            AbstractValue::Array(_) => AbstractValue::Array(inner),
            AbstractValue::Ref(_) => AbstractValue::Ref(inner),
        }
    }
}

impl fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractValue::Array(s) => write!(f, "{}{}", s.dtype, s.shape),
            AbstractValue::Ref(s) => write!(f, "Ref{{{}{}}}", s.dtype, s.shape),
        }
    }
}

/// A value that is either known now or known only by its type.
#[derive(Debug, Clone)]
pub enum PartialVal {
    /// Concrete value available while tracing.
    Known(Value),
    /// Value to be computed by the staged graph.
    Unknown(AbstractValue),
}

impl PartialVal {
    /// Build from exactly one of an abstract value or a known value.
    pub fn new(aval: Option<AbstractValue>, known: Option<Value>) -> Result<Self> {
        match (aval, known) {
            (None, Some(value)) => Ok(PartialVal::Known(value)),
            (Some(aval), None) => Ok(PartialVal::Unknown(aval)),
            _ => Err(Error::InvalidPartialVal),
        }
    }

    /// A known partial value.
    pub fn known(value: impl Into<Value>) -> Self {
        PartialVal::Known(value.into())
    }

    /// An unknown partial value of the given type.
    pub fn unknown(aval: AbstractValue) -> Self {
        PartialVal::Unknown(aval)
    }

    /// Returns true if the value is available now.
    pub fn is_known(&self) -> bool {
        matches!(self, PartialVal::Known(_))
    }

    /// The known value, if any.
    pub fn get_known(&self) -> Option<&Value> {
        match self {
            PartialVal::Known(v) => Some(v),
            PartialVal::Unknown(_) => None,
        }
    }

    /// The abstract type: the stored one, or the abstraction of the known value.
    pub fn get_aval(&self) -> AbstractValue {
        match self {
            PartialVal::Known(v) => AbstractValue::of(v),
            PartialVal::Unknown(aval) => aval.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArrayRef;

    #[test]
    fn test_partial_val_requires_exactly_one() {
        let aval = AbstractValue::scalar(DType::Float32);
        let value = Value::from(Array::scalar(1.0, DType::Float32));
        assert!(PartialVal::new(Some(aval.clone()), None).is_ok());
        assert!(PartialVal::new(None, Some(value.clone())).unwrap().is_known());
        assert!(matches!(
            PartialVal::new(Some(aval), Some(value)),
            Err(Error::InvalidPartialVal)
        ));
        assert!(matches!(PartialVal::new(None, None), Err(Error::InvalidPartialVal)));
    }

    #[test]
    fn test_get_aval_of_known() {
        let pv = PartialVal::known(Array::zeros(vec![2, 3], DType::Int32));
        assert_eq!(pv.get_aval(), AbstractValue::array(vec![2, 3], DType::Int32));
        assert!(pv.get_known().is_some());

        let cell = ArrayRef::new(Array::zeros(vec![4], DType::Float32));
        let pv = PartialVal::known(Value::from(cell));
        assert!(pv.get_aval().is_ref());
        assert_eq!(pv.get_aval().deref(), AbstractValue::array(vec![4], DType::Float32));
    }

    #[test]
    fn test_display() {
        assert_eq!(AbstractValue::array(vec![3], DType::Float32).to_string(), "f32(3,)");
        assert_eq!(AbstractValue::reference(vec![2, 2], DType::Int32).to_string(), "Ref{i32(2, 2)}");
    }
}
