//! Reversible couplings.
//!
//! A coupling maps a four-slot [`RevState`] to a new one through a block `F`. Its inputs can be
//! recomputed from its outputs, so the backward pass reconstructs what it needs instead of
//! keeping the block's activations alive.
//!
//! | Coupling             | Forward                                            | Inverse                                   |
//! |----------------------|----------------------------------------------------|-------------------------------------------|
//! | [`Coupling::RevNet`] | `(x1, x2) -> (x2, x1 + F(x2))`                     | `x2 = p'`, `x1 = s' - F(p')`              |
//! | [`Coupling::Momentum`] | `v' = a v + (1 - a) F(x)`, `x' = x + v'`         | `x = x' - v'`, `v = (v' - (1 - a) F(x)) / a` |
//!
//! The two accumulator slots are carried through unchanged; revnet swaps them together with the
//! streams.

use super::checkpoint::Replay;
use super::{accumulate, GradCell, GraphNode, Variable};
use crate::tensor::Tensor;
use crate::Result;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;
use tracing::trace;

/// Four-slot state threaded through reversible blocks.
#[derive(Clone, Debug)]
pub struct RevState {
    pub primary: Variable,
    pub primary_accum: Variable,
    pub secondary: Variable,
    pub secondary_accum: Variable,
}

impl RevState {
    /// Initial state `(x, 0, x, 0)`.
    pub fn new(x: &Variable) -> Self {
        let zeros = Variable::constant(Tensor::zeros(x.shape().clone()));
        Self {
            primary: x.clone(),
            primary_accum: zeros.clone(),
            secondary: x.clone(),
            secondary_accum: zeros,
        }
    }

    /// Collapses the state to one tensor: `primary + secondary`.
    pub fn merge(&self) -> Result<Variable> {
        self.primary.add(&self.secondary)
    }

    fn slots(&self) -> [&Variable; 4] {
        [
            &self.primary,
            &self.primary_accum,
            &self.secondary,
            &self.secondary_accum,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Coupling {
    RevNet,
    Momentum { alpha: f32 },
}

impl Coupling {
    /// The slot of `state` the block is applied to.
    pub fn block_input<'a>(&self, state: &'a RevState) -> &'a Variable {
        match self {
            Coupling::RevNet => &state.secondary,
            Coupling::Momentum { .. } => &state.primary,
        }
    }

    /// Applies the coupling. `fx` is the block's value at [`Coupling::block_input`]; `f` replays
    /// the block during the backward pass.
    pub fn forward(&self, state: &RevState, fx: Tensor, f: Replay) -> Result<RevState> {
        let (primary, secondary) = match *self {
            Coupling::RevNet => {
                let y1 = (&state.primary.data + &fx)?;
                (state.secondary.data.clone(), y1)
            }
            Coupling::Momentum { alpha } => {
                let v = state
                    .secondary
                    .data
                    .mul_scalar(alpha)
                    .zip_with(&fx, |v, f| v + (1.0 - alpha) * f)?;
                let x = (&state.primary.data + &v)?;
                (x, v)
            }
        };
        let (primary_accum, secondary_accum) = match self {
            Coupling::RevNet => (
                state.secondary_accum.data.clone(),
                state.primary_accum.data.clone(),
            ),
            Coupling::Momentum { .. } => (
                state.primary_accum.data.clone(),
                state.secondary_accum.data.clone(),
            ),
        };

        let inputs = state.slots();
        let out_grads: [GradCell; 4] = std::array::from_fn(|_| Rc::new(RefCell::new(None)));
        let node = Rc::new(CouplingNode {
            coupling: *self,
            primary: primary.clone(),
            secondary: secondary.clone(),
            in_grads: inputs.map(|v| v.requires_grad().then(|| v.grad.clone())),
            out_grads: out_grads.clone(),
            parents: inputs.iter().filter_map(|v| v.node.clone()).collect(),
            f,
        });
        let [g0, g1, g2, g3] = out_grads;
        Ok(RevState {
            primary: Variable::with_node(primary, g0, node.clone()),
            primary_accum: Variable::with_node(primary_accum, g1, node.clone()),
            secondary: Variable::with_node(secondary, g2, node.clone()),
            secondary_accum: Variable::with_node(secondary_accum, g3, node),
        })
    }

    /// Input of `F` recovered from the stored outputs.
    fn reconstruct_block_input(
        &self,
        primary_out: &Tensor,
        secondary_out: &Tensor,
    ) -> Result<Tensor> {
        match self {
            Coupling::RevNet => Ok(primary_out.clone()),
            Coupling::Momentum { .. } => Ok((primary_out - secondary_out)?),
        }
    }
}

/// Graph node of one coupling. Holds its outputs, never its inputs.
struct CouplingNode {
    coupling: Coupling,
    primary: Tensor,
    secondary: Tensor,
    in_grads: [Option<GradCell>; 4],
    out_grads: [GradCell; 4],
    parents: Vec<Rc<dyn GraphNode>>,
    f: Replay,
}

impl Debug for CouplingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouplingNode")
            .field("coupling", &self.coupling)
            .field("primary", &self.primary)
            .finish()
    }
}

impl GraphNode for CouplingNode {
    fn backward(&self) -> Result<()> {
        if self.out_grads.iter().all(|g| g.borrow().is_none()) {
            return Ok(());
        }
        let shape = self.primary.shape().clone();
        let [gp, gpa, gs, gsa] = std::array::from_fn::<Tensor, 4, _>(|i| {
            self.out_grads[i]
                .borrow()
                .clone()
                .unwrap_or_else(|| Tensor::zeros(shape.clone()))
        });

        let x = self
            .coupling
            .reconstruct_block_input(&self.primary, &self.secondary)?;
        trace!(coupling = ?self.coupling, shape = %shape, "reconstructing coupling input");
        let local_in = Variable::new(x);
        let fx = (self.f)(&local_in)?;

        // Gradients of (primary, primary_accum, secondary, secondary_accum) of the input state.
        let grads = match self.coupling {
            Coupling::RevNet => {
                fx.backward_with(gs.clone())?;
                let dfx = local_in.grad().unwrap_or_else(|| Tensor::zeros(shape.clone()));
                let dx2 = (&gp + &dfx)?;
                [gs, gsa, dx2, gpa]
            }
            Coupling::Momentum { alpha } => {
                let total = (&gs + &gp)?;
                fx.backward_with(total.mul_scalar(1.0 - alpha))?;
                let dfx = local_in.grad().unwrap_or_else(|| Tensor::zeros(shape.clone()));
                let dx = (&gp + &dfx)?;
                [dx, gpa, total.mul_scalar(alpha), gsa]
            }
        };
        for (cell, grad) in self.in_grads.iter().zip(grads) {
            if let Some(cell) = cell {
                accumulate(cell, grad)?;
            }
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Dimension, Shape};

    fn shape() -> Shape {
        Shape::new(vec![Dimension::new("x", 3)]).unwrap()
    }

    fn block(w: &Variable) -> Replay {
        let w = w.clone();
        Rc::new(move |x: &Variable| -> Result<Variable> { Ok(x.mul(&w)?.tanh()) })
    }

    fn apply(coupling: Coupling, state: &RevState, f: Replay) -> Result<RevState> {
        let fx = f(&coupling.block_input(state).detach())?.data;
        coupling.forward(state, fx, f)
    }

    /// Loss through two stacked couplings followed by merge, as a plain function of the input.
    fn loss(coupling: Coupling, x: &Variable, w: &Variable) -> Result<Variable> {
        let mut state = RevState::new(x);
        for _ in 0..2 {
            state = apply(coupling, &state, block(w))?;
        }
        state.merge()?.square().sum_all()
    }

    /// Same computation written out with ordinary differentiable ops.
    fn reference(coupling: Coupling, x: &Variable, w: &Variable) -> Result<Variable> {
        let f = |v: &Variable| -> Result<Variable> { Ok(v.mul(w)?.tanh()) };
        let (mut p, mut s) = (x.clone(), x.clone());
        for _ in 0..2 {
            match coupling {
                Coupling::RevNet => {
                    let y1 = p.add(&f(&s)?)?;
                    p = s;
                    s = y1;
                }
                Coupling::Momentum { alpha } => {
                    let v = s.mul_scalar(alpha).add(&f(&p)?.mul_scalar(1.0 - alpha))?;
                    p = p.add(&v)?;
                    s = v;
                }
            }
        }
        p.add(&s)?.square().sum_all()
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < 1e-5, "{:?} vs {:?}", a.data(), b.data());
        }
    }

    fn check(coupling: Coupling) {
        let w = Variable::new(Tensor::new(vec![0.7, -0.3, 1.2], shape()).unwrap());
        let x = Variable::new(Tensor::new(vec![0.2, -0.5, 0.9], shape()).unwrap());

        let expected = reference(coupling, &x, &w).unwrap();
        expected.backward().unwrap();
        let (dx, dw) = (x.grad().unwrap(), w.grad().unwrap());
        x.zero_grad();
        w.zero_grad();

        let got = loss(coupling, &x, &w).unwrap();
        assert!((got.data.item().unwrap() - expected.data.item().unwrap()).abs() < 1e-5);
        got.backward().unwrap();
        assert_close(&x.grad().unwrap(), &dx);
        assert_close(&w.grad().unwrap(), &dw);
    }

    #[test]
    fn test_revnet_gradients_match_reference() {
        check(Coupling::RevNet);
    }

    #[test]
    fn test_momentum_gradients_match_reference() {
        check(Coupling::Momentum { alpha: 0.9 });
    }

    #[test]
    fn test_block_input_recovered_from_outputs() {
        let w = Variable::new(Tensor::new(vec![0.7, -0.3, 1.2], shape()).unwrap());
        let f = block(&w);
        let state = RevState {
            primary: Variable::constant(Tensor::new(vec![0.1, 0.2, 0.3], shape()).unwrap()),
            primary_accum: Variable::constant(Tensor::zeros(shape())),
            secondary: Variable::constant(Tensor::new(vec![-0.4, 0.5, 0.6], shape()).unwrap()),
            secondary_accum: Variable::constant(Tensor::zeros(shape())),
        };
        for coupling in [Coupling::RevNet, Coupling::Momentum { alpha: 0.5 }] {
            let out = apply(coupling, &state, f.clone()).unwrap();
            let x = coupling
                .reconstruct_block_input(&out.primary.data, &out.secondary.data)
                .unwrap();
            assert_close(&x, &coupling.block_input(&state).data);
        }
    }
}
