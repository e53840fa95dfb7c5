//! One training step: build, backpropagate, update.

use crate::config::ModelParameter;
use crate::model::{self, BuildInputs};
use crate::optim::{Optimizer, StepReport};
use crate::scope::BuildContext;
use crate::store::ParameterStore;
use crate::Result;
use std::rc::Rc;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub loss: f32,
    pub token_loss: Option<f32>,
    pub video_loss: Option<f32>,
    pub accuracy: Option<f32>,
    pub optimizer: StepReport,
}

/// Builds the model on `inputs` against `store`, backpropagates the total loss and applies one
/// optimizer step.
///
/// Each step uses a fresh [`BuildContext`], so parameter names are identical across steps and
/// only the dropout stream changes.
pub fn train_step(
    params: &Rc<ModelParameter>,
    store: &ParameterStore,
    optimizer: &mut Optimizer,
    inputs: &BuildInputs,
) -> Result<TrainReport> {
    store.zero_grad();
    let mut ctx = BuildContext::for_step(params.clone(), store.clone(), optimizer.step_count());
    let output = model::build(&mut ctx, inputs)?;
    output.total_loss.backward()?;
    let step = optimizer.step(store)?;

    let scalar = |v: &crate::autograd::Variable| v.data.item().ok();
    let report = TrainReport {
        loss: output.total_loss.data.item()?,
        token_loss: output.token_loss.as_ref().and_then(scalar),
        video_loss: output.video_loss.as_ref().and_then(scalar),
        accuracy: output.accuracy.as_ref().and_then(|a| a.item().ok()),
        optimizer: step,
    };
    info!(step = report.optimizer.step, loss = report.loss, "train step");
    Ok(report)
}
