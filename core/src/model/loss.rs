//! Loss composition for the token and video heads.
//!
//! Every loss is a scalar [`Variable`]. The losses that are optimised go into `loss_list`; the
//! reported video loss is additionally renormalised by the fraction of unmasked targets so its
//! magnitude does not depend on how much of the batch was padding.

use super::input::per_head_layout;
use super::{require, Masks};
use crate::autograd::Variable;
use crate::config::{ModelParameter, VOCAB};
use crate::scope::BuildContext;
use crate::tensor::{DType, Shape, Tensor};
use crate::Result;
use tracing::debug;

pub struct LossInputs<'a> {
    pub frame_out: Option<&'a Variable>,
    pub token_out: Option<&'a Variable>,
    pub txt_tgt: Option<&'a Tensor>,
    pub txt_msk: Option<&'a Tensor>,
    pub vid_tgt: Option<&'a Tensor>,
    pub masks: &'a Masks,
}

#[derive(Debug, Clone, Default)]
pub struct Losses {
    pub loss_list: Vec<Variable>,
    pub token_loss: Option<Variable>,
    pub accuracy: Option<Tensor>,
    pub video_loss: Option<Variable>,
}

pub fn compose(ctx: &mut BuildContext, inputs: LossInputs<'_>) -> Result<Losses> {
    let params = ctx.params.clone();
    let mut losses = Losses::default();

    if params.use_language {
        let logits = require_output(inputs.token_out, "token_out")?;
        let target = require(inputs.txt_tgt, "txt_tgt")?;
        let token_loss = token_cross_entropy(&params, logits, target, inputs.txt_msk)?;
        losses.loss_list.push(token_loss.clone());
        losses.token_loss = Some(token_loss);
        if params.calc_accuracy {
            losses.accuracy = Some(token_accuracy(logits, target)?);
        }
    }

    if params.use_video {
        let frame_out = require_output(inputs.frame_out, "frame_out")?;
        let target = require(inputs.vid_tgt, "vid_tgt")?;
        let masks = inputs.masks;
        let loss = if params.use_discrete_video_loss {
            discrete_video_loss(&params, frame_out, target, &masks.vid_tgt, &masks.cat_tgt)?
        } else {
            continuous_video_loss(frame_out, target, &masks.vid_tgt, &masks.cat_tgt)?
        };
        losses.loss_list.push(loss.clone());
        let scale = mask_scale(&masks.vid_tgt) * mask_scale(&masks.cat_tgt);
        losses.video_loss = Some(loss.mul_scalar(scale));
    }

    debug!(losses = losses.loss_list.len(), "losses composed");
    Ok(losses)
}

fn require_output<'a>(value: Option<&'a Variable>, name: &str) -> Result<&'a Variable> {
    value.ok_or_else(|| crate::Error::MissingArgument(name.to_string()))
}

/// `mask.size / sum(mask)`; 0 for a mask with nothing left.
fn mask_scale(mask: &Tensor) -> f32 {
    let sum = mask.sum_all();
    if sum > 0.0 {
        mask.size() as f32 / sum
    } else {
        0.0
    }
}

/// Softmax cross-entropy over `vocab`, averaged over every target position.
///
/// With `mask` the average only counts positions where the mask is non-zero.
pub fn token_cross_entropy(
    params: &ModelParameter,
    logits: &Variable,
    target: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Variable> {
    let vocab = params.vocab_dim();
    let positions = logits.shape().minus(std::slice::from_ref(&vocab));
    let lse = logits.reduce_logsumexp(&positions)?;
    let one_hot = Variable::constant(target.one_hot(&vocab)?);
    let picked = Variable::einsum(&[logits, &one_hot], &positions)?;
    let per_token = lse.sub(&picked)?;

    match mask {
        Some(mask) => {
            let weight = mask.cast(DType::F32).broadcast_to(per_token.shape())?;
            let count = weight.sum_all().max(1.0);
            Ok(per_token
                .mul(&Variable::constant(weight))?
                .sum_all()?
                .mul_scalar(1.0 / count))
        }
        None => per_token.mean_all(),
    }
}

/// Fraction of positions where the arg-max logit is the target token.
pub fn token_accuracy(logits: &Variable, target: &Tensor) -> Result<Tensor> {
    let hits = logits.data.argmax(VOCAB)?.equal(target)?;
    Ok(Tensor::scalar(hits.sum_all() / hits.size().max(1) as f32))
}

/// Cross-entropy of the `[.., color_channels, discrete_color]` logits, written as
/// `lse(logits) - logits[target]`, masked, summed per head and then to a scalar. Both terms are
/// scaled by `1 / target.size`.
pub fn discrete_video_loss(
    params: &ModelParameter,
    frame_out: &Variable,
    target: &Tensor,
    vid_msk: &Tensor,
    cat_msk: &Tensor,
) -> Result<Variable> {
    let per_head = |mask: &Tensor| -> Result<Variable> {
        let mask = if mask.shape().is_scalar() {
            mask.clone()
        } else {
            per_head_layout(params, mask)?
        };
        Ok(Variable::constant(mask))
    };
    let (vid_msk, cat_msk) = (per_head(vid_msk)?, per_head(cat_msk)?);
    let size = 1.0 / target.size() as f32;
    let heads = Shape::new(vec![params.heads_dim()])?;
    let colors = params.discrete_color_dim();

    let lse = frame_out.reduce_logsumexp(&frame_out.shape().minus(std::slice::from_ref(&colors)))?;
    let normaliser = Variable::einsum(&[&lse, &vid_msk, &cat_msk], &heads)?.mul_scalar(size);
    let one_hot = Variable::constant(target.one_hot(&colors)?);
    let picked =
        Variable::einsum(&[frame_out, &one_hot, &vid_msk, &cat_msk], &heads)?.mul_scalar(-size);
    normaliser.add(&picked)?.sum_all()
}

/// Masked mean absolute error, `sum(sign(d) * d * masks) / size` with `d = pred - target`.
pub fn continuous_video_loss(
    frame_out: &Variable,
    target: &Tensor,
    vid_msk: &Tensor,
    cat_msk: &Tensor,
) -> Result<Variable> {
    let diff = frame_out.sub(&Variable::constant(target.clone()))?;
    let sign = Variable::constant(diff.data.sign());
    let (vid_msk, cat_msk) = (
        Variable::constant(vid_msk.clone()),
        Variable::constant(cat_msk.clone()),
    );
    let total = Variable::einsum(&[&diff, &vid_msk, &cat_msk, &sign], &Shape::scalar())?;
    Ok(total.mul_scalar(1.0 / frame_out.data.size() as f32))
}
