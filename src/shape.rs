//! Shapes whose dimensions may be static sizes or references to graph values.

use crate::trace::Var;
use std::fmt;

/// A single dimension of a shape.
///
/// A dynamic dimension names the graph variable that holds its size at
/// runtime, so avals can depend on other values of the same graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Size known while tracing.
    Static(usize),
    /// Size held by a scalar integer variable.
    Dynamic(Var),
}

impl Dim {
    /// Returns the static size, if any.
    #[inline]
    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dim::Static(n) => Some(*n),
            Dim::Dynamic(_) => None,
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Static(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{}", n),
            Dim::Dynamic(var) => write!(f, "{}", var),
        }
    }
}

/// Shape of an n-dimensional value.
///
/// An empty dimension list represents a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<Dim>,
}

impl Shape {
    /// Create a fully static shape.
    ///
    /// # Examples
    ///
    /// ```
    /// # use jaxpr_rs::Shape;
    /// let shape = Shape::new(vec![2, 3, 4]);
    /// assert_eq!(shape.ndim(), 3);
    /// assert_eq!(shape.size(), Some(24));
    /// ```
    pub fn new(dims: Vec<usize>) -> Self {
        Self {
            dims: dims.into_iter().map(Dim::Static).collect(),
        }
    }

    /// Create a shape from possibly dynamic dimensions.
    pub fn from_dims(dims: Vec<Dim>) -> Self {
        Self { dims }
    }

    /// Create a scalar shape.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    /// Returns the number of dimensions.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Returns the dimensions.
    #[inline]
    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Returns true if this is a scalar shape.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Returns true if no dimension is dynamic.
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| matches!(d, Dim::Static(_)))
    }

    /// Static sizes of every dimension, or `None` if any is dynamic.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dim::as_static).collect()
    }

    /// Total number of elements, or `None` if any dimension is dynamic.
    pub fn size(&self) -> Option<usize> {
        self.static_dims().map(|dims| dims.iter().product())
    }

    /// Variables referenced by dynamic dimensions, in order.
    pub fn dynamic_vars(&self) -> impl Iterator<Item = &Var> {
        self.dims.iter().filter_map(|d| match d {
            Dim::Dynamic(v) => Some(v),
            Dim::Static(_) => None,
        })
    }

    /// Rewrite every dynamic dimension through `f`.
    pub fn map_dynamic(&self, mut f: impl FnMut(&Var) -> Dim) -> Shape {
        Shape {
            dims: self
                .dims
                .iter()
                .map(|d| match d {
                    Dim::Dynamic(v) => f(v),
                    Dim::Static(n) => Dim::Static(*n),
                })
                .collect(),
        }
    }

    /// Broadcast two shapes following NumPy rules.
    ///
    /// Dynamic dimensions are compatible with an identical dynamic dimension
    /// or with a static 1.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let ndim = self.ndim().max(other.ndim());
        let one = Dim::Static(1);
        let mut result = Vec::with_capacity(ndim);

        for i in 0..ndim {
            let d1 = if i < self.ndim() {
                &self.dims[self.ndim() - 1 - i]
            } else {
                &one
            };
            let d2 = if i < other.ndim() {
                &other.dims[other.ndim() - 1 - i]
            } else {
                &one
            };

            if d1 == d2 || *d2 == one {
                result.push(d1.clone());
            } else if *d1 == one {
                result.push(d2.clone());
            } else {
                return None;
            }
        }

        result.reverse();
        Some(Shape { dims: result })
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}
