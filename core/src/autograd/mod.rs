//! Automatic Differentiation (Autograd) module.
//!
//! # What is Autograd?
//!
//! Automatic Differentiation (AD) evaluates the derivative of a function specified by a program.
//! It is how the training loop obtains the gradient of the total loss with respect to every
//! trainable parameter.
//!
//! `vidtext` implements **Reverse-Mode AD** with a **tape**: every differentiable operation on
//! [`Variable`]s records a [`GraphNode`] that knows how to turn the gradient of its output into
//! gradients of its inputs.
//!
//! # Example: Simple Gradient Computation
//!
//! We want the derivative of $f(x) = x^2$ at $x = 3$, which is $2x = 6$.
//!
//! ```rust
//! use vidtext::tensor::Tensor;
//! use vidtext::autograd::Variable;
//!
//! let x = Variable::new(Tensor::scalar(3.0));
//! let y = x.mul(&x).unwrap();
//! y.backward().unwrap();
//!
//! assert_eq!(x.grad().unwrap().item().unwrap(), 6.0);
//! ```
//!
//! # Memory reduction
//!
//! Two node kinds trade compute for memory:
//! - [`checkpoint::recompute_grad`] keeps only a block's output and replays the block during the
//!   backward pass.
//! - [`reversible`] couplings store only their outputs and reconstruct their inputs from them.
//!
//! Both replay user code through a closure. The closure owns a snapshot of the build context, so a
//! replay creates the same parameter names, reuses the same parameters and draws the same
//! dropout masks as the original forward pass.

use crate::tensor::{Shape, Tensor};
use crate::Result;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

pub mod checkpoint;
pub mod engine;
pub mod ops;
pub mod reversible;

/// Shared, lazily filled gradient slot.
pub type GradCell = Rc<RefCell<Option<Tensor>>>;

/// A node in the computation graph.
///
/// This trait represents an operation that can be backpropagated through.
pub trait GraphNode: Debug {
    /// Reads the gradient of this node's output(s) and accumulates the gradients of its inputs.
    fn backward(&self) -> Result<()>;
    /// Returns the nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A variable in the computation graph.
///
/// Wraps a `Tensor` and tracks its gradient and the operation that created it.
#[derive(Clone)]
pub struct Variable {
    /// The actual tensor data.
    pub data: Tensor,
    /// The gradient of the loss with respect to this variable.
    pub grad: GradCell,
    /// The node in the computation graph that produced this variable.
    pub node: Option<Rc<dyn GraphNode>>,
    requires_grad: bool,
}

impl Variable {
    /// Creates a new leaf variable that collects a gradient.
    ///
    /// Leaf variables are the inputs of the graph that training cares about: parameters.
    pub fn new(data: Tensor) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
            requires_grad: true,
        }
    }

    /// Creates a leaf that never collects a gradient (input data, masks, constants).
    ///
    /// Operations whose inputs are all constants record no graph node.
    pub fn constant(data: Tensor) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
            requires_grad: false,
        }
    }

    /// Creates an output variable of `node`, whose gradient lands in `grad`.
    pub fn with_node(data: Tensor, grad: GradCell, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
            requires_grad: true,
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Same value, cut off from the graph.
    pub fn detach(&self) -> Variable {
        Variable::constant(self.data.clone())
    }

    pub fn shape(&self) -> &Shape {
        self.data.shape()
    }

    /// A copy of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad.borrow().clone()
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Triggers the backward pass starting from this variable.
    ///
    /// This variable is typically the loss value (a scalar). Its gradient is seeded with ones
    /// unless one is already present.
    pub fn backward(&self) -> Result<()> {
        if self.grad.borrow().is_none() {
            *self.grad.borrow_mut() = Some(Tensor::ones(self.shape().clone()));
        }
        engine::backward(self.node.clone())
    }

    /// Backward pass with an explicit output gradient, accumulated onto any existing one.
    pub fn backward_with(&self, seed: Tensor) -> Result<()> {
        accumulate(&self.grad, seed)?;
        engine::backward(self.node.clone())
    }
}

impl Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("data", &self.data)
            .field("requires_grad", &self.requires_grad)
            .field("has_node", &self.node.is_some())
            .finish()
    }
}

/// Adds `grad` into `cell`, initialising it on first use.
pub(crate) fn accumulate(cell: &GradCell, grad: Tensor) -> Result<()> {
    let mut slot = cell.borrow_mut();
    let next = match slot.take() {
        Some(existing) => (&existing + &grad)?,
        None => grad,
    };
    *slot = Some(next);
    Ok(())
}
