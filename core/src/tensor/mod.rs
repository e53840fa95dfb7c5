//! Core Tensor implementation.
//!
//! # What is a Tensor here?
//!
//! A [`Tensor`] is a dense, row-major block of `f32` values described by a [`Shape`] of
//! **named** dimensions. Names replace axis positions: element-wise operations broadcast by
//! name, reductions keep the dimensions you name, and [`Tensor::einsum`] contracts every
//! dimension that is absent from the requested output shape.
//!
//! ```rust
//! use vidtext::tensor::{Dimension, Shape, Tensor};
//!
//! let shape = Shape::new(vec![Dimension::new("batch", 2), Dimension::new("features", 3)]).unwrap();
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], shape).unwrap();
//!
//! // Sum over `batch`, keep `features`.
//! let features = Shape::new(vec![Dimension::new("features", 3)]).unwrap();
//! let summed = x.reduce_sum(&features).unwrap();
//! assert_eq!(summed.data(), &[5.0, 7.0, 9.0]);
//! ```
//!
//! Storage sits behind an [`Arc`], so cloning a tensor (which the autograd tape does for every
//! saved activation) never copies data. Operations always allocate fresh output buffers.
//!
//! Integer-valued data (token ids, quantised colours) is stored as `f32` as well and tagged with
//! a [`DType`]; casts truncate and, for `U8`, wrap.

use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

pub mod ops;
pub mod shape;

pub use shape::{Dimension, Shape};

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// A shape names the same dimension twice.
    #[error("Duplicate dimension `{0}`")]
    DuplicateDimension(String),
    /// An operation referred to a dimension the tensor does not have.
    #[error("Dimension `{name}` not found in shape {shape}")]
    MissingDimension { name: String, shape: String },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// A kernel rejected its arguments.
    #[error("Kernel error: {0}")]
    Kernel(#[from] vidtext_kernels::KernelError),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Logical element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DType {
    #[default]
    F32,
    /// Signed integers, e.g. token ids and quantised pixels.
    I64,
    /// Bytes; values wrap modulo 256.
    U8,
}

impl DType {
    pub fn is_integer(self) -> bool {
        !matches!(self, DType::F32)
    }
}

/// The core Tensor struct.
#[derive(Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    data: Arc<Vec<f32>>,
}

impl Tensor {
    /// Creates a new Tensor from a flat vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the size of
    /// `shape`.
    pub fn new(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.size() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![shape.size()],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            shape,
            dtype: DType::F32,
            data: Arc::new(data),
        })
    }

    /// Creates an integer-typed tensor. Values are truncated towards zero.
    pub fn new_integer(data: Vec<f32>, shape: Shape) -> Result<Self> {
        Ok(Self::new(data, shape)?.cast(DType::I64))
    }

    /// Creates a new Tensor filled with `value`.
    pub fn full(shape: Shape, value: f32) -> Self {
        let size = shape.size();
        Self {
            shape,
            dtype: DType::F32,
            data: Arc::new(vec![value; size]),
        }
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: Shape) -> Self {
        Self::full(shape, 1.0)
    }

    /// A rank-0 tensor.
    pub fn scalar(value: f32) -> Self {
        Self::full(Shape::scalar(), value)
    }

    /// Builds a tensor by evaluating `f` at every flat index.
    pub fn from_fn(shape: Shape, f: impl FnMut(usize) -> f32) -> Self {
        let data = (0..shape.size()).map(f).collect();
        Self {
            shape,
            dtype: DType::F32,
            data: Arc::new(data),
        }
    }

    pub(crate) fn from_parts(data: Vec<f32>, shape: Shape, dtype: DType) -> Self {
        debug_assert_eq!(data.len(), shape.size());
        Self {
            shape,
            dtype,
            data: Arc::new(data),
        }
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the underlying data as a slice.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data, copying it first if it is shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.size() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![1],
                got: self.shape.sizes(),
            });
        }
        Ok(self.data[0])
    }

    /// Whether two handles point at the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape.to_string())
            .field("dtype", &self.dtype)
            .field("data_len", &self.data.len())
            .finish()
    }
}
