//! Named dimensions and shapes.
//!
//! Every axis of a [`Tensor`](super::Tensor) carries a name. Operations line axes up by name
//! rather than by position, the way mesh-style tensor libraries do: adding a `[batch, features]`
//! tensor to a `[features]` tensor broadcasts over `batch` regardless of where `features` sits.
//!
//! ```rust
//! use vidtext::tensor::{Dimension, Shape};
//!
//! let shape = Shape::new(vec![Dimension::new("batch", 2), Dimension::new("features", 8)]).unwrap();
//! assert_eq!(shape.size(), 16);
//! assert_eq!(shape.index_of("features"), Some(1));
//! ```

use super::{Result, TensorError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named, sized axis. Symbolic: it describes data, it does not hold any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: usize,
}

impl Dimension {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Same axis with the name prefixed by `_`.
    ///
    /// Anonymous copies let one tensor carry two axes that describe the same quantity, e.g. the
    /// query and key positions inside attention or the input and output side of a square weight.
    pub fn anonymous(&self) -> Self {
        Self::new(anonymous_name(&self.name), self.size)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.size)
    }
}

pub(crate) fn anonymous_name(name: &str) -> String {
    format!("_{name}")
}

/// Ordered list of dimensions with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    /// Creates a shape, rejecting repeated dimension names.
    pub fn new(dims: Vec<Dimension>) -> Result<Self> {
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].iter().any(|d| d.name == dim.name) {
                return Err(TensorError::DuplicateDimension(dim.name.clone()));
            }
        }
        Ok(Self { dims })
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.dims.iter().map(|d| d.size).product()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.size).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.dims.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|d| d.name == name)
    }

    /// Looks a dimension up by name, failing with [`TensorError::MissingDimension`].
    pub fn require(&self, name: &str) -> Result<&Dimension> {
        self.get(name)
            .ok_or_else(|| TensorError::MissingDimension {
                name: name.to_string(),
                shape: self.to_string(),
            })
    }

    /// Row-major strides.
    pub fn strides(&self) -> Vec<usize> {
        vidtext_kernels::row_major_strides(&self.sizes())
    }

    /// Dimensions of `self` followed by the dimensions of `other` not already present.
    ///
    /// Fails when both shapes name the same axis with different sizes.
    pub fn union(&self, other: &Shape) -> Result<Shape> {
        let mut dims = self.dims.clone();
        for dim in &other.dims {
            match self.get(&dim.name) {
                Some(existing) if existing.size != dim.size => {
                    return Err(TensorError::ShapeMismatch {
                        expected: vec![existing.size],
                        got: vec![dim.size],
                    })
                }
                Some(_) => {}
                None => dims.push(dim.clone()),
            }
        }
        Ok(Shape { dims })
    }

    /// `self` without any dimension whose name appears in `other`.
    pub fn minus(&self, other: &[Dimension]) -> Shape {
        Shape {
            dims: self
                .dims
                .iter()
                .filter(|d| !other.iter().any(|o| o.name == d.name))
                .cloned()
                .collect(),
        }
    }

    /// `self` followed by `extra`; fails on name collisions.
    pub fn extend(&self, extra: &[Dimension]) -> Result<Shape> {
        let mut dims = self.dims.clone();
        dims.extend(extra.iter().cloned());
        Shape::new(dims)
    }

    /// Replaces the dimension called `name` with `with`.
    pub fn replace(&self, name: &str, with: Dimension) -> Result<Shape> {
        let idx = self.index_of(name).ok_or_else(|| TensorError::MissingDimension {
            name: name.to_string(),
            shape: self.to_string(),
        })?;
        let mut dims = self.dims.clone();
        dims[idx] = with;
        Shape::new(dims)
    }

    /// Renames `from` to `to`, keeping the size.
    pub fn rename(&self, from: &str, to: &str) -> Result<Shape> {
        let size = self.require(from)?.size;
        self.replace(from, Dimension::new(to, size))
    }

    /// Whether `self` and `other` hold the same named dimensions, in any order.
    pub fn same_dims(&self, other: &Shape) -> bool {
        self.ndims() == other.ndims() && self.dims.iter().all(|d| other.dims.contains(d))
    }
}

impl From<Vec<Dimension>> for Shape {
    /// Infallible conversion for callers that already guarantee unique names.
    ///
    /// Duplicate names are dropped, keeping the first occurrence.
    fn from(dims: Vec<Dimension>) -> Self {
        let mut unique: Vec<Dimension> = Vec::with_capacity(dims.len());
        for dim in dims {
            if !unique.iter().any(|d| d.name == dim.name) {
                unique.push(dim);
            }
        }
        Shape { dims: unique }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Convenience constructor: `shape![("batch", 2), ("features", 4)]`.
#[macro_export]
macro_rules! shape {
    () => { $crate::tensor::Shape::scalar() };
    ($(($name:expr, $size:expr)),+ $(,)?) => {
        $crate::tensor::Shape::new(vec![$($crate::tensor::Dimension::new($name, $size)),+])
    };
}
