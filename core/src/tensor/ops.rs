//! Tensor operations.
//!
//! # Overview
//!
//! This module implements the numeric engine of `vidtext`. It handles:
//! - **Element-wise Arithmetic**: `+`, `-`, `*`, `/` with broadcasting **by dimension name**.
//! - **Reductions**: sum, max, min, mean and log-sum-exp down to a requested output shape.
//! - **Einsum**: contraction of any number of operands into an output shape.
//! - **Layout**: reshape, transpose, slice, pad, concat, rename.
//!
//! # Broadcasting
//!
//! Two operands are aligned by dimension name. The output shape is the lhs shape followed by the
//! rhs dimensions the lhs lacks; a dimension present in both must have the same size in both.
//!
//! ```rust
//! use vidtext::tensor::{Dimension, Shape, Tensor};
//!
//! let bf = Shape::new(vec![Dimension::new("batch", 2), Dimension::new("features", 2)]).unwrap();
//! let f = Shape::new(vec![Dimension::new("features", 2)]).unwrap();
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], bf).unwrap();
//! let bias = Tensor::new(vec![10.0, 20.0], f).unwrap();
//!
//! let y = (&x + &bias).unwrap();
//! assert_eq!(y.data(), &[11.0, 22.0, 13.0, 24.0]);
//! ```
//!
//! # Einsum lowering
//!
//! Operands are folded left to right. For each pair, dimensions neither needed by the output nor
//! by a later operand are summed out first; the remaining shared dimensions become the batch
//! axis (if still needed) or the contracted axis (if not). Both operands are permuted with
//! [`vidtext_kernels::cpu_permute`] and multiplied with one [`vidtext_kernels::cpu_matmul`].
//!
//! > [!TIP]
//! > Element-wise work is parallelised with `rayon`; for the small tensors in unit tests the
//! > scheduling overhead dominates, which is fine.

use super::{DType, Dimension, Result, Shape, Tensor, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};
use vidtext_kernels::{cpu_matmul, cpu_permute};

/// Implements a broadcasting binary arithmetic trait (e.g., `Add`, `Sub`) for `&Tensor`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl $trait for &Tensor {
            type Output = crate::tensor::Result<Tensor>;

            fn $method(self, rhs: Self) -> Self::Output {
                self.zip_with(rhs, |a, b| a.$method(b))
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

/// Per-output-axis strides into `src`; zero for axes `src` does not have.
fn broadcast_strides(src: &Shape, out: &Shape) -> Result<Vec<usize>> {
    for dim in src.dims() {
        let target = out.require(&dim.name)?;
        if target.size != dim.size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![target.size],
                got: vec![dim.size],
            });
        }
    }
    let src_strides = src.strides();
    Ok(out
        .dims()
        .iter()
        .map(|d| src.index_of(&d.name).map_or(0, |i| src_strides[i]))
        .collect())
}

fn offset_of(mut flat: usize, sizes: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for axis in (0..sizes.len()).rev() {
        offset += (flat % sizes[axis]) * strides[axis];
        flat /= sizes[axis];
    }
    offset
}

fn merged_dtype(a: DType, b: DType) -> DType {
    if a == b {
        a
    } else {
        DType::F32
    }
}

impl Tensor {
    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use vidtext::tensor::{Dimension, Shape, Tensor};
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0], Shape::new(vec![Dimension::new("x", 3)]).unwrap()).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let data: Vec<f32> = self.data().par_iter().map(|v| f(*v)).collect();
        Tensor::from_parts(data, self.shape().clone(), DType::F32)
    }

    /// Broadcasting element-wise combination of two tensors.
    pub fn zip_with<F>(&self, rhs: &Tensor, f: F) -> Result<Tensor>
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        let out_shape = self.shape().union(rhs.shape())?;
        let lhs = self.broadcast_to(&out_shape)?;
        let rhs_b = rhs.broadcast_to(&out_shape)?;
        let data: Vec<f32> = lhs
            .data()
            .par_iter()
            .zip(rhs_b.data().par_iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Ok(Tensor::from_parts(
            data,
            out_shape,
            merged_dtype(self.dtype(), rhs.dtype()),
        ))
    }

    /// Materialises `self` in `shape`: permutes shared axes into `shape`'s order and repeats the
    /// data over axes `self` does not have.
    pub fn broadcast_to(&self, shape: &Shape) -> Result<Tensor> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        if self.shape().same_dims(shape) {
            return self.transpose_to(shape);
        }
        let strides = broadcast_strides(self.shape(), shape)?;
        let sizes = shape.sizes();
        let src = self.data();
        let data: Vec<f32> = (0..shape.size())
            .into_par_iter()
            .map(|i| src[offset_of(i, &sizes, &strides)])
            .collect();
        Ok(Tensor::from_parts(data, shape.clone(), self.dtype()))
    }

    /// Reorders the axes to match `shape`, which must hold exactly the same dimensions.
    pub fn transpose_to(&self, shape: &Shape) -> Result<Tensor> {
        if !self.shape().same_dims(shape) {
            return Err(TensorError::Unsupported(format!(
                "cannot transpose {} to {}",
                self.shape(),
                shape
            )));
        }
        let names: Vec<&str> = shape.names();
        let data = self.permuted_data(&names)?;
        Ok(Tensor::from_parts(data, shape.clone(), self.dtype()))
    }

    fn permuted_data(&self, names: &[&str]) -> Result<Vec<f32>> {
        let perm = names
            .iter()
            .map(|n| {
                self.shape()
                    .index_of(n)
                    .ok_or_else(|| TensorError::MissingDimension {
                        name: n.to_string(),
                        shape: self.shape().to_string(),
                    })
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(cpu_permute(self.data(), &self.shape().sizes(), &perm)?)
    }

    /// Reduces every axis absent from `out` with `reduce`, which sees one contiguous group of
    /// reduced values per output element.
    fn reduce_with<F>(&self, out: &Shape, reduce: F) -> Result<Tensor>
    where
        F: Fn(&[f32]) -> f32 + Sync + Send,
    {
        for dim in out.dims() {
            let own = self.shape().require(&dim.name)?;
            if own.size != dim.size {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![own.size],
                    got: vec![dim.size],
                });
            }
        }
        let reduced = self.shape().minus(out.dims());
        let group = reduced.size();
        let mut order: Vec<&str> = out.names();
        order.extend(reduced.names());
        let data = self.permuted_data(&order)?;
        let values: Vec<f32> = if group == 0 {
            vec![reduce(&[]); out.size()]
        } else {
            data.par_chunks(group).map(&reduce).collect()
        };
        Ok(Tensor::from_parts(values, out.clone(), DType::F32))
    }

    /// Sums over every dimension not present in `out`.
    pub fn reduce_sum(&self, out: &Shape) -> Result<Tensor> {
        self.reduce_with(out, |g| g.iter().sum())
    }

    pub fn reduce_mean(&self, out: &Shape) -> Result<Tensor> {
        self.reduce_with(out, |g| {
            if g.is_empty() {
                0.0
            } else {
                g.iter().sum::<f32>() / g.len() as f32
            }
        })
    }

    pub fn reduce_max(&self, out: &Shape) -> Result<Tensor> {
        self.reduce_with(out, |g| g.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    pub fn reduce_min(&self, out: &Shape) -> Result<Tensor> {
        self.reduce_with(out, |g| g.iter().copied().fold(f32::INFINITY, f32::min))
    }

    /// Numerically stable `log(sum(exp(x)))` over the dimensions absent from `out`.
    pub fn reduce_logsumexp(&self, out: &Shape) -> Result<Tensor> {
        self.reduce_with(out, |g| {
            let max = g.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max.is_finite() {
                return max;
            }
            max + g.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
        })
    }

    /// Sum of every element.
    pub fn sum_all(&self) -> f32 {
        self.data().par_iter().sum()
    }

    /// Softmax along `dim`.
    pub fn softmax(&self, dim: &str) -> Result<Tensor> {
        let dim = self.shape().require(dim)?.clone();
        let lse = self.reduce_logsumexp(&self.shape().minus(&[dim]))?;
        self.zip_with(&lse, |x, l| (x - l).exp())
    }

    /// Einstein summation: every dimension of the operands absent from `output` is summed out.
    ///
    /// `output` may also name dimensions none of the operands carry; the result is broadcast
    /// over them.
    pub fn einsum(operands: &[&Tensor], output: &Shape) -> Result<Tensor> {
        let (first, rest) = operands
            .split_first()
            .ok_or_else(|| TensorError::Unsupported("einsum without operands".to_string()))?;
        let mut acc = (*first).clone();
        for (i, next) in rest.iter().enumerate() {
            let mut needed: Vec<Dimension> = output.dims().to_vec();
            for later in &rest[i + 1..] {
                for dim in later.shape().dims() {
                    if !needed.iter().any(|d| d.name == dim.name) {
                        needed.push(dim.clone());
                    }
                }
            }
            acc = contract_pair(&acc, next, &needed)?;
        }
        let kept = Shape::from(
            acc.shape()
                .dims()
                .iter()
                .filter(|d| output.contains(&d.name))
                .cloned()
                .collect::<Vec<_>>(),
        );
        let acc = if kept.ndims() == acc.shape().ndims() {
            acc
        } else {
            acc.reduce_sum(&kept)?
        };
        acc.broadcast_to(output)
    }

    /// Reinterprets the data with a new shape of equal size. Row-major order is kept.
    pub fn reshape(&self, shape: Shape) -> Result<Tensor> {
        if shape.size() != self.size() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.sizes(),
                got: self.shape().sizes(),
            });
        }
        Ok(Tensor::from_parts(
            self.data().to_vec(),
            shape,
            self.dtype(),
        ))
    }

    /// Renames a dimension without touching the data.
    pub fn rename_dim(&self, from: &str, to: &str) -> Result<Tensor> {
        let shape = self.shape().rename(from, to)?;
        let mut out = self.clone();
        out.shape = shape;
        Ok(out)
    }

    /// `(outer, size, inner)` element counts around `dim`.
    fn split_around(&self, dim: &str) -> Result<(usize, usize, usize)> {
        let axis = self.shape().index_of(dim).ok_or_else(|| TensorError::MissingDimension {
            name: dim.to_string(),
            shape: self.shape().to_string(),
        })?;
        let sizes = self.shape().sizes();
        let outer = sizes[..axis].iter().product();
        let inner = sizes[axis + 1..].iter().product();
        Ok((outer, sizes[axis], inner))
    }

    /// Keeps indices `[start, end)` of `dim`. The dimension keeps its name.
    pub fn slice(&self, dim: &str, start: usize, end: usize) -> Result<Tensor> {
        let (outer, size, inner) = self.split_around(dim)?;
        if start > end || end > size {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start, end],
                shape: self.shape().sizes(),
            });
        }
        let mut data = Vec::with_capacity(outer * (end - start) * inner);
        let src = self.data();
        for o in 0..outer {
            data.extend_from_slice(&src[(o * size + start) * inner..(o * size + end) * inner]);
        }
        let shape = self.shape().replace(dim, Dimension::new(dim, end - start))?;
        Ok(Tensor::from_parts(data, shape, self.dtype()))
    }

    /// Zero-pads `dim` with `before` and `after` entries.
    pub fn pad(&self, dim: &str, before: usize, after: usize) -> Result<Tensor> {
        let (outer, size, inner) = self.split_around(dim)?;
        let new_size = before + size + after;
        let mut data = vec![0.0; outer * new_size * inner];
        let src = self.data();
        for o in 0..outer {
            let dst = (o * new_size + before) * inner;
            data[dst..dst + size * inner]
                .copy_from_slice(&src[o * size * inner..(o + 1) * size * inner]);
        }
        let shape = self.shape().replace(dim, Dimension::new(dim, new_size))?;
        Ok(Tensor::from_parts(data, shape, self.dtype()))
    }

    /// Concatenates along `dim`. All other dimensions must agree; the first tensor's axis order
    /// is used for the output.
    pub fn concat(tensors: &[&Tensor], dim: &str) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::Unsupported("concat of zero tensors".to_string()))?;
        let mut total = 0;
        let mut parts = Vec::with_capacity(tensors.len());
        for t in tensors {
            let size = t.shape().require(dim)?.size;
            let target = first.shape().replace(dim, Dimension::new(dim, size))?;
            parts.push(t.broadcast_to(&target)?);
            total += size;
        }
        let (outer, _, inner) = first.split_around(dim)?;
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for part in &parts {
                let (_, size, _) = part.split_around(dim)?;
                data.extend_from_slice(&part.data()[o * size * inner..(o + 1) * size * inner]);
            }
        }
        let shape = first.shape().replace(dim, Dimension::new(dim, total))?;
        let dtype = parts
            .iter()
            .map(|p| p.dtype())
            .fold(first.dtype(), merged_dtype);
        Ok(Tensor::from_parts(data, shape, dtype))
    }

    /// One-hot encodes integer values into a new trailing dimension. Out-of-range values encode
    /// to all zeros.
    pub fn one_hot(&self, dim: &Dimension) -> Result<Tensor> {
        let shape = self.shape().extend(std::slice::from_ref(dim))?;
        let depth = dim.size;
        let mut data = vec![0.0; shape.size()];
        data.par_chunks_mut(depth.max(1))
            .zip(self.data().par_iter())
            .for_each(|(row, v)| {
                let idx = v.trunc();
                if idx >= 0.0 && (idx as usize) < depth {
                    row[idx as usize] = 1.0;
                }
            });
        Ok(Tensor::from_parts(data, shape, DType::F32))
    }

    /// Index of the maximum along `dim`, first occurrence on ties.
    pub fn argmax(&self, dim: &str) -> Result<Tensor> {
        let reduced = self.shape().require(dim)?.clone();
        let out = self.shape().minus(std::slice::from_ref(&reduced));
        let mut result = self.reduce_with(&out, |g| {
            let mut best = 0;
            for (i, v) in g.iter().enumerate() {
                if *v > g[best] {
                    best = i;
                }
            }
            best as f32
        })?;
        result.dtype = DType::I64;
        Ok(result)
    }

    /// Changes the dtype tag; integer casts truncate towards zero and `U8` wraps modulo 256.
    pub fn cast(&self, dtype: DType) -> Tensor {
        let mut out = match dtype {
            DType::F32 => self.clone(),
            DType::I64 => self.map(f32::trunc),
            DType::U8 => self.map(|v| v.trunc().rem_euclid(256.0)),
        };
        out.dtype = dtype;
        out
    }

    /// Integer floor division by a scalar.
    pub fn floordiv(&self, divisor: f32) -> Tensor {
        let mut out = self.map(|v| (v / divisor).floor());
        out.dtype = self.dtype();
        out
    }

    /// Non-negative remainder by a scalar.
    pub fn modulo(&self, divisor: f32) -> Tensor {
        let mut out = self.map(|v| v.rem_euclid(divisor));
        out.dtype = self.dtype();
        out
    }

    pub fn add_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v + value)
    }

    pub fn mul_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v * value)
    }

    pub fn maximum(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, f32::max)
    }

    pub fn minimum(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, f32::min)
    }

    /// `1.0` where equal, `0.0` elsewhere.
    pub fn equal(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, |a, b| if a == b { 1.0 } else { 0.0 })
    }

    /// Sign with `sign(0) == 0`.
    pub fn sign(&self) -> Tensor {
        self.map(|v| {
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }
        })
    }
}

/// Contracts two operands, keeping only dimensions in `needed`.
fn contract_pair(a: &Tensor, b: &Tensor, needed: &[Dimension]) -> Result<Tensor> {
    let is_needed = |name: &str| needed.iter().any(|d| d.name == name);
    let a = sum_private(a, b.shape(), &is_needed)?;
    let b = sum_private(b, a.shape(), &is_needed)?;

    let mut batch = Vec::new();
    let mut contracted = Vec::new();
    let mut a_free = Vec::new();
    for dim in a.shape().dims() {
        match b.shape().get(&dim.name) {
            Some(other) if other.size != dim.size => {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![dim.size],
                    got: vec![other.size],
                })
            }
            Some(_) if is_needed(&dim.name) => batch.push(dim.clone()),
            Some(_) => contracted.push(dim.clone()),
            None => a_free.push(dim.clone()),
        }
    }
    let b_free: Vec<Dimension> = b
        .shape()
        .dims()
        .iter()
        .filter(|d| !a.shape().contains(&d.name))
        .cloned()
        .collect();

    let a_data = a.permuted_data(&axis_names(&[
        batch.as_slice(),
        a_free.as_slice(),
        contracted.as_slice(),
    ]))?;
    let b_data = b.permuted_data(&axis_names(&[
        batch.as_slice(),
        contracted.as_slice(),
        b_free.as_slice(),
    ]))?;
    let product = |dims: &[Dimension]| dims.iter().map(|d| d.size).product::<usize>();
    let data = cpu_matmul(
        &a_data,
        &b_data,
        product(&batch),
        product(&a_free),
        product(&contracted),
        product(&b_free),
    )?;

    let mut dims = batch;
    dims.extend(a_free);
    dims.extend(b_free);
    Ok(Tensor::from_parts(data, Shape::new(dims)?, DType::F32))
}

fn axis_names<'a>(groups: &[&'a [Dimension]]) -> Vec<&'a str> {
    groups
        .iter()
        .flat_map(|group| group.iter().map(|d| d.name.as_str()))
        .collect()
}

/// Sums out dimensions of `t` that neither `other` nor the caller needs.
fn sum_private(t: &Tensor, other: &Shape, is_needed: &dyn Fn(&str) -> bool) -> Result<Tensor> {
    let keep: Vec<Dimension> = t
        .shape()
        .dims()
        .iter()
        .filter(|d| other.contains(&d.name) || is_needed(&d.name))
        .cloned()
        .collect();
    if keep.len() == t.shape().ndims() {
        Ok(t.clone())
    } else {
        t.reduce_sum(&Shape::from(keep))
    }
}
