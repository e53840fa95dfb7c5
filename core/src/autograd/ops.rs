//! Differentiable operations.
//!
//! Each operation computes its forward value with the [`Tensor`] API and records an [`OpNode`]
//! holding a backward closure. The closure maps the gradient of the output to one gradient per
//! input, already reduced to that input's shape.

use super::{accumulate, GradCell, GraphNode, Variable};
use crate::tensor::{Dimension, Shape, Tensor};
use crate::Result;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

type BackwardFn = Box<dyn Fn(&Tensor) -> Result<Vec<Tensor>>>;

/// A recorded operation with an arbitrary number of inputs.
struct OpNode {
    op: &'static str,
    /// Gradient slots of the inputs; `None` for inputs that do not need a gradient.
    inputs: Vec<Option<GradCell>>,
    out_grad: GradCell,
    parents: Vec<Rc<dyn GraphNode>>,
    backward_fn: BackwardFn,
}

impl Debug for OpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpNode")
            .field("op", &self.op)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

impl GraphNode for OpNode {
    fn backward(&self) -> Result<()> {
        let grad = match self.out_grad.borrow().as_ref() {
            Some(g) => g.clone(),
            None => return Ok(()),
        };
        let grads = (self.backward_fn)(&grad)?;
        for (cell, g) in self.inputs.iter().zip(grads) {
            if let Some(cell) = cell {
                accumulate(cell, g)?;
            }
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Wraps `data` as the output of `op`. Records nothing when no input needs a gradient.
pub(crate) fn record<F>(op: &'static str, data: Tensor, inputs: &[&Variable], backward_fn: F) -> Variable
where
    F: Fn(&Tensor) -> Result<Vec<Tensor>> + 'static,
{
    if !inputs.iter().any(|v| v.requires_grad()) {
        return Variable::constant(data);
    }
    let parents = inputs.iter().filter_map(|v| v.node.clone()).collect();
    let out_grad: GradCell = Rc::new(RefCell::new(None));
    let node = Rc::new(OpNode {
        op,
        inputs: inputs
            .iter()
            .map(|v| v.requires_grad().then(|| v.grad.clone()))
            .collect(),
        out_grad: out_grad.clone(),
        parents,
        backward_fn: Box::new(backward_fn),
    });
    Variable::with_node(data, out_grad, node)
}

/// Sums a broadcast gradient back down to `shape`.
pub(crate) fn unbroadcast(grad: &Tensor, shape: &Shape) -> Result<Tensor> {
    if grad.shape() == shape {
        Ok(grad.clone())
    } else {
        Ok(grad.reduce_sum(shape)?)
    }
}

impl Variable {
    pub fn add(&self, rhs: &Variable) -> Result<Variable> {
        let data = (&self.data + &rhs.data)?;
        let (ls, rs) = (self.shape().clone(), rhs.shape().clone());
        Ok(record("add", data, &[self, rhs], move |g| {
            Ok(vec![unbroadcast(g, &ls)?, unbroadcast(g, &rs)?])
        }))
    }

    pub fn sub(&self, rhs: &Variable) -> Result<Variable> {
        let data = (&self.data - &rhs.data)?;
        let (ls, rs) = (self.shape().clone(), rhs.shape().clone());
        Ok(record("sub", data, &[self, rhs], move |g| {
            Ok(vec![
                unbroadcast(g, &ls)?,
                unbroadcast(&g.mul_scalar(-1.0), &rs)?,
            ])
        }))
    }

    pub fn mul(&self, rhs: &Variable) -> Result<Variable> {
        let data = (&self.data * &rhs.data)?;
        let (a, b) = (self.data.clone(), rhs.data.clone());
        Ok(record("mul", data, &[self, rhs], move |g| {
            Ok(vec![
                unbroadcast(&(g * &b)?, a.shape())?,
                unbroadcast(&(g * &a)?, b.shape())?,
            ])
        }))
    }

    pub fn div(&self, rhs: &Variable) -> Result<Variable> {
        let data = (&self.data / &rhs.data)?;
        let (a, b) = (self.data.clone(), rhs.data.clone());
        Ok(record("div", data, &[self, rhs], move |g| {
            let da = (g / &b)?;
            let db = (&(g * &a)? / &b.map(|v| v * v))?.mul_scalar(-1.0);
            Ok(vec![unbroadcast(&da, a.shape())?, unbroadcast(&db, b.shape())?])
        }))
    }

    pub fn add_scalar(&self, value: f32) -> Variable {
        record("add_scalar", self.data.add_scalar(value), &[self], |g| {
            Ok(vec![g.clone()])
        })
    }

    pub fn mul_scalar(&self, value: f32) -> Variable {
        record("mul_scalar", self.data.mul_scalar(value), &[self], move |g| {
            Ok(vec![g.mul_scalar(value)])
        })
    }

    /// Element-wise `f` with derivative `df`, both evaluated at the input.
    pub fn unary(&self, op: &'static str, f: fn(f32) -> f32, df: fn(f32) -> f32) -> Variable {
        let x = self.data.clone();
        record(op, self.data.map(f), &[self], move |g| {
            Ok(vec![g.zip_with(&x, move |g, x| g * df(x))?])
        })
    }

    pub fn exp(&self) -> Variable {
        self.unary("exp", f32::exp, f32::exp)
    }

    pub fn ln(&self) -> Variable {
        self.unary("ln", f32::ln, |x| 1.0 / x)
    }

    pub fn square(&self) -> Variable {
        self.unary("square", |x| x * x, |x| 2.0 * x)
    }

    pub fn rsqrt(&self) -> Variable {
        self.unary("rsqrt", |x| 1.0 / x.sqrt(), |x| -0.5 / (x * x.sqrt()))
    }

    pub fn abs(&self) -> Variable {
        self.unary("abs", f32::abs, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        })
    }

    pub fn sigmoid(&self) -> Variable {
        self.unary("sigmoid", sigmoid, |x| {
            let s = sigmoid(x);
            s * (1.0 - s)
        })
    }

    pub fn tanh(&self) -> Variable {
        self.unary("tanh", f32::tanh, |x| 1.0 - x.tanh().powi(2))
    }

    pub fn relu(&self) -> Variable {
        self.unary("relu", |x| x.max(0.0), |x| if x > 0.0 { 1.0 } else { 0.0 })
    }

    /// GELU, tanh approximation.
    pub fn gelu(&self) -> Variable {
        self.unary("gelu", gelu, gelu_grad)
    }

    /// Einstein summation over variables. See [`Tensor::einsum`].
    pub fn einsum(operands: &[&Variable], output: &Shape) -> Result<Variable> {
        let tensors: Vec<Tensor> = operands.iter().map(|v| v.data.clone()).collect();
        let refs: Vec<&Tensor> = tensors.iter().collect();
        let data = Tensor::einsum(&refs, output)?;
        Ok(record("einsum", data, operands, move |g| {
            (0..tensors.len())
                .map(|i| -> Result<Tensor> {
                    let mut terms: Vec<&Tensor> = vec![g];
                    terms.extend(
                        tensors
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, t)| t),
                    );
                    Ok(Tensor::einsum(&terms, tensors[i].shape())?)
                })
                .collect()
        }))
    }

    /// Sums over every dimension not in `out`.
    pub fn reduce_sum(&self, out: &Shape) -> Result<Variable> {
        let data = self.data.reduce_sum(out)?;
        let shape = self.shape().clone();
        Ok(record("reduce_sum", data, &[self], move |g| {
            Ok(vec![g.broadcast_to(&shape)?])
        }))
    }

    pub fn reduce_mean(&self, out: &Shape) -> Result<Variable> {
        let data = self.data.reduce_mean(out)?;
        let shape = self.shape().clone();
        let count = (shape.size() / out.size().max(1)).max(1) as f32;
        Ok(record("reduce_mean", data, &[self], move |g| {
            Ok(vec![g.broadcast_to(&shape)?.mul_scalar(1.0 / count)])
        }))
    }

    /// Sum of every element as a scalar.
    pub fn sum_all(&self) -> Result<Variable> {
        self.reduce_sum(&Shape::scalar())
    }

    pub fn mean_all(&self) -> Result<Variable> {
        self.reduce_mean(&Shape::scalar())
    }

    pub fn reduce_logsumexp(&self, out: &Shape) -> Result<Variable> {
        let data = self.data.reduce_logsumexp(out)?;
        let (x, lse) = (self.data.clone(), data.clone());
        Ok(record("reduce_logsumexp", data, &[self], move |g| {
            let softmax = x.zip_with(&lse, |x, l| (x - l).exp())?;
            Ok(vec![(&softmax * g)?.broadcast_to(x.shape())?])
        }))
    }

    pub fn softmax(&self, dim: &str) -> Result<Variable> {
        let data = self.data.softmax(dim)?;
        let y = data.clone();
        let reduced = self.shape().minus(std::slice::from_ref(self.shape().require(dim)?));
        Ok(record("softmax", data, &[self], move |g| {
            let gy = (g * &y)?;
            let dot = gy.reduce_sum(&reduced)?;
            let centered = g.zip_with(&dot, |g, d| g - d)?;
            Ok(vec![(&y * &centered)?])
        }))
    }

    pub fn broadcast_to(&self, shape: &Shape) -> Result<Variable> {
        let data = self.data.broadcast_to(shape)?;
        let own = self.shape().clone();
        Ok(record("broadcast", data, &[self], move |g| {
            Ok(vec![unbroadcast(g, &own)?])
        }))
    }

    pub fn reshape(&self, shape: Shape) -> Result<Variable> {
        let data = self.data.reshape(shape)?;
        let (own, out) = (self.shape().clone(), data.shape().clone());
        Ok(record("reshape", data, &[self], move |g| {
            Ok(vec![g.broadcast_to(&out)?.reshape(own.clone())?])
        }))
    }

    pub fn rename_dim(&self, from: &str, to: &str) -> Result<Variable> {
        let data = self.data.rename_dim(from, to)?;
        let (from, to) = (from.to_string(), to.to_string());
        Ok(record("rename", data, &[self], move |g| {
            Ok(vec![g.rename_dim(&to, &from)?])
        }))
    }

    pub fn slice(&self, dim: &str, start: usize, end: usize) -> Result<Variable> {
        let data = self.data.slice(dim, start, end)?;
        let size = self.shape().require(dim)?.size;
        let dim = dim.to_string();
        let out = data.shape().clone();
        Ok(record("slice", data, &[self], move |g| {
            Ok(vec![g.broadcast_to(&out)?.pad(&dim, start, size - end)?])
        }))
    }

    /// Concatenates along `dim` in the order given.
    pub fn concat(parts: &[&Variable], dim: &str) -> Result<Variable> {
        let tensors: Vec<&Tensor> = parts.iter().map(|v| &v.data).collect();
        let data = Tensor::concat(&tensors, dim)?;
        let sizes = parts
            .iter()
            .map(|v| Ok(v.shape().require(dim)?.size))
            .collect::<Result<Vec<usize>>>()?;
        let shapes: Vec<Shape> = parts.iter().map(|v| v.shape().clone()).collect();
        let out = data.shape().clone();
        let dim = dim.to_string();
        Ok(record("concat", data, parts, move |g| {
            let g = g.broadcast_to(&out)?;
            let mut offset = 0;
            let mut grads = Vec::with_capacity(sizes.len());
            for (size, shape) in sizes.iter().zip(&shapes) {
                grads.push(g.slice(&dim, offset, offset + size)?.transpose_to(shape)?);
                offset += size;
            }
            Ok(grads)
        }))
    }

    /// `self * weight + other * (1 - weight)`.
    pub fn weighted_add(&self, other: &Variable, weight: &Variable) -> Result<Variable> {
        let lhs = self.mul(weight)?;
        let complement = weight.mul_scalar(-1.0).add_scalar(1.0);
        lhs.add(&other.mul(&complement)?)
    }

    /// Renames `dim` to its anonymous counterpart.
    pub fn anonymize(&self, dim: &Dimension) -> Result<Variable> {
        self.rename_dim(&dim.name, &dim.anonymous().name)
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

const GELU_COEF: f32 = 0.044_715;
const SQRT_2_OVER_PI: f32 = 0.797_884_6;

fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF * x.powi(3))).tanh())
}

fn gelu_grad(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEF * x.powi(3));
    let t = inner.tanh();
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEF * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[(&str, usize)]) -> Shape {
        Shape::new(dims.iter().map(|(n, s)| Dimension::new(*n, *s)).collect()).unwrap()
    }

    fn var(data: Vec<f32>, dims: &[(&str, usize)]) -> Variable {
        Variable::new(Tensor::new(data, shape(dims)).unwrap())
    }

    /// Compares the analytic gradient of `f(x).sum()` with central differences.
    fn check_grad(x: &Variable, f: impl Fn(&Variable) -> Result<Variable>) {
        let out = f(x).unwrap().sum_all().unwrap();
        out.backward().unwrap();
        let analytic = x.grad().unwrap();

        let eps = 1e-2;
        for i in 0..x.data.size() {
            let mut plus = x.data.clone();
            plus.data_mut()[i] += eps;
            let mut minus = x.data.clone();
            minus.data_mut()[i] -= eps;
            let fp = f(&Variable::constant(plus)).unwrap().data.sum_all();
            let fm = f(&Variable::constant(minus)).unwrap().data.sum_all();
            let numeric = (fp - fm) / (2.0 * eps);
            let got = analytic.data()[i];
            assert!(
                (numeric - got).abs() < 2e-2 * (1.0 + numeric.abs()),
                "index {i}: numeric {numeric} vs analytic {got}"
            );
        }
    }

    #[test]
    fn test_mul_same_variable() {
        let x = Variable::new(Tensor::scalar(3.0));
        let y = x.mul(&x).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 6.0);
    }

    #[test]
    fn test_broadcast_add_reduces_gradient() {
        let x = var(vec![1.0, 2.0, 3.0, 4.0], &[("b", 2), ("f", 2)]);
        let bias = var(vec![0.5, 0.5], &[("f", 2)]);
        let y = x.add(&bias).unwrap().sum_all().unwrap();
        y.backward().unwrap();
        assert_eq!(bias.grad().unwrap().data(), &[2.0, 2.0]);
        assert_eq!(x.grad().unwrap().data(), &[1.0; 4]);
    }

    #[test]
    fn test_constants_record_nothing() {
        let c = Variable::constant(Tensor::scalar(2.0));
        let y = c.mul(&c).unwrap();
        assert!(y.node.is_none());
        assert!(!y.requires_grad());
    }

    #[test]
    fn test_div_grad() {
        let x = var(vec![1.0, -2.0, 3.0], &[("a", 3)]);
        let d = Variable::constant(
            Tensor::new(vec![2.0, 4.0, -1.0], shape(&[("a", 3)])).unwrap(),
        );
        check_grad(&x, |x| x.div(&d));
        let y = var(vec![2.0, 4.0, -1.5], &[("a", 3)]);
        let n = Variable::constant(Tensor::new(vec![1.0, 2.0, 3.0], shape(&[("a", 3)])).unwrap());
        check_grad(&y, |y| n.div(y));
    }

    #[test]
    fn test_einsum_grad() {
        let x = var(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &[("b", 2), ("k", 3)]);
        let w = Variable::constant(
            Tensor::new(vec![1.0, -1.0, 0.5, 2.0, 0.0, 1.5], shape(&[("k", 3), ("n", 2)])).unwrap(),
        );
        check_grad(&x, |x| {
            Variable::einsum(&[x, &w], &shape(&[("b", 2), ("n", 2)]))?.square().sum_all()
        });
    }

    #[test]
    fn test_softmax_and_logsumexp_grad() {
        let x = var(vec![0.3, -1.0, 2.0, 0.5, 0.1, -0.4], &[("a", 2), ("v", 3)]);
        let w = Variable::constant(
            Tensor::new(vec![1.0, 2.0, 3.0], shape(&[("v", 3)])).unwrap(),
        );
        check_grad(&x, |x| x.softmax("v")?.mul(&w));
        let x2 = var(vec![0.3, -1.0, 2.0, 0.5, 0.1, -0.4], &[("a", 2), ("v", 3)]);
        check_grad(&x2, |x| Ok(x.reduce_logsumexp(&shape(&[("a", 2)]))?.square()));
    }

    #[test]
    fn test_slice_concat_grad() {
        let x = var(vec![1.0, 2.0, 3.0, 4.0], &[("t", 4)]);
        let head = x.slice("t", 0, 1).unwrap();
        let tail = x.slice("t", 2, 4).unwrap().mul_scalar(3.0);
        let joined = Variable::concat(&[&head, &tail], "t").unwrap();
        assert_eq!(joined.data.data(), &[1.0, 9.0, 12.0]);
        joined.sum_all().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 0.0, 3.0, 3.0]);
    }

    #[test]
    fn test_activation_grads() {
        let x = var(vec![-1.5, -0.2, 0.3, 1.7], &[("a", 4)]);
        check_grad(&x, |x| Ok(x.gelu()));
        let x = var(vec![-1.5, -0.2, 0.3, 1.7], &[("a", 4)]);
        check_grad(&x, |x| Ok(x.sigmoid()));
        let x = var(vec![-1.5, -0.2, 0.3, 1.7], &[("a", 4)]);
        check_grad(&x, |x| Ok(x.tanh()));
        let x = var(vec![0.5, 1.0, 2.0, 4.0], &[("a", 4)]);
        check_grad(&x, |x| Ok(x.rsqrt()));
    }

    #[test]
    fn test_rename_and_reshape_grad() {
        let x = var(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[("a", 2), ("b", 3)]);
        let w = Variable::constant(
            Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], shape(&[("c", 6)])).unwrap(),
        );
        check_grad(&x, |x| {
            x.rename_dim("a", "_a")?
                .reshape(shape(&[("c", 6)]))?
                .mul(&w)
        });
    }

    #[test]
    fn test_weighted_add() {
        let a = var(vec![1.0, 1.0], &[("x", 2)]);
        let b = var(vec![5.0, 5.0], &[("x", 2)]);
        let w = Variable::constant(Tensor::new(vec![1.0, 0.0], shape(&[("x", 2)])).unwrap());
        let out = a.weighted_add(&b, &w).unwrap();
        assert_eq!(out.data.data(), &[1.0, 5.0]);
    }
}
