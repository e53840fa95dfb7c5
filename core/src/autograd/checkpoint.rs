//! Recompute-on-backward (gradient checkpointing).
//!
//! [`recompute_grad`] wraps the output of a block whose intermediate graph was thrown away. When
//! the backward pass reaches it, the block is replayed on the saved input with a fresh graph, and
//! that local graph is differentiated.
//!
//! The replay must reproduce the forward computation exactly. Blocks built through
//! [`crate::scope::BuildContext::replayable`] achieve this by replaying against a cloned snapshot
//! of the context taken before the block first ran.

use super::{accumulate, GradCell, GraphNode, Variable};
use crate::tensor::Tensor;
use crate::Result;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;
use tracing::trace;

/// A replayable single-input, single-output block.
pub type Replay = Rc<dyn Fn(&Variable) -> Result<Variable>>;

struct RecomputeNode {
    input: Tensor,
    input_grad: Option<GradCell>,
    out_grad: GradCell,
    parents: Vec<Rc<dyn GraphNode>>,
    replay: Replay,
}

impl Debug for RecomputeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomputeNode")
            .field("input", &self.input)
            .finish()
    }
}

impl GraphNode for RecomputeNode {
    fn backward(&self) -> Result<()> {
        let grad = match self.out_grad.borrow().as_ref() {
            Some(g) => g.clone(),
            None => return Ok(()),
        };
        trace!(shape = %self.input.shape(), "replaying checkpointed block");
        let local_in = Variable::new(self.input.clone());
        let local_out = (self.replay)(&local_in)?;
        local_out.backward_with(grad)?;
        if let Some(cell) = &self.input_grad {
            let dx = local_in
                .grad()
                .unwrap_or_else(|| Tensor::zeros(self.input.shape().clone()));
            accumulate(cell, dx)?;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Attaches `output`, the value of `replay(input)`, to the graph without keeping the block's
/// activations alive.
///
/// Gradients with respect to `input` and to every parameter the block touches are identical to
/// running the block directly.
pub fn recompute_grad(input: &Variable, output: Tensor, replay: Replay) -> Variable {
    let out_grad: GradCell = Rc::new(RefCell::new(None));
    let node = Rc::new(RecomputeNode {
        input: input.data.clone(),
        input_grad: input.requires_grad().then(|| input.grad.clone()),
        out_grad: out_grad.clone(),
        parents: input.node.iter().cloned().collect(),
        replay,
    });
    Variable::with_node(output, out_grad, node)
}
