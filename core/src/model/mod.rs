//! Graph assembly for the video + language model.
//!
//! [`build`] runs the four stages in order, each in its own scope under `model_mode`:
//!
//! 1. [`input`]: video and/or text into one feature-space tensor (`input0`).
//! 2. [`body`]: the block stack under the configured memory-reduction strategy (`body0`).
//! 3. [`output`]: token logits and frame predictions (`output0`).
//! 4. [`loss`]: token cross-entropy and the video loss (`loss0`).
//!
//! The context's attention index is reset afterwards, so the next build starts cycling attention
//! dimensions from the first one again.

pub mod body;
pub mod input;
pub mod loss;
pub mod output;

use crate::autograd::Variable;
use crate::scope::BuildContext;
use crate::tensor::{DType, Dimension, Tensor};
use crate::{Error, Result};
use tracing::info;

/// Raw inputs of one build. Every field is optional; which ones are required depends on
/// `use_video` and `use_language`.
///
/// Masks hold `1.0` for real content and `0.0` for padding and default to a scalar one.
#[derive(Debug, Clone, Default)]
pub struct BuildInputs {
    /// `[batch, time, ...spatial, color_channels]`, one more frame than the model predicts.
    pub vid: Option<Tensor>,
    pub cat_msk_src: Option<Tensor>,
    pub cat_msk_tgt: Option<Tensor>,
    /// `[batch, sequence, spatial_ctx, language_token_patch]` token ids.
    pub txt_src: Option<Tensor>,
    pub txt_tgt: Option<Tensor>,
    pub vid_msk_src: Option<Tensor>,
    pub vid_msk_tgt: Option<Tensor>,
    /// Token-loss mask; positions where it is 0 are left out of the mean.
    pub txt_msk: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub total_loss: Variable,
    pub loss_list: Vec<Variable>,
    /// Video loss renormalised by the fraction of unmasked targets.
    pub video_loss: Option<Variable>,
    pub accuracy: Option<Tensor>,
    pub token_loss: Option<Variable>,
    pub frame_out: Option<Variable>,
    pub token_out: Option<Variable>,
}

/// Masks after defaulting, cast to `F32`.
#[derive(Debug, Clone)]
pub struct Masks {
    pub cat_src: Tensor,
    pub cat_tgt: Tensor,
    pub vid_src: Tensor,
    pub vid_tgt: Tensor,
}

impl Masks {
    pub fn from_inputs(inputs: &BuildInputs) -> Self {
        Self {
            cat_src: default_ones(inputs.cat_msk_src.as_ref()),
            cat_tgt: default_ones(inputs.cat_msk_tgt.as_ref()),
            vid_src: default_ones(inputs.vid_msk_src.as_ref()),
            vid_tgt: default_ones(inputs.vid_msk_tgt.as_ref()),
        }
    }
}

fn default_ones(mask: Option<&Tensor>) -> Tensor {
    mask.map_or_else(|| Tensor::scalar(1.0), |m| m.cast(DType::F32))
}

pub(crate) fn require<'a>(tensor: Option<&'a Tensor>, name: &str) -> Result<&'a Tensor> {
    tensor.ok_or_else(|| Error::MissingArgument(name.to_string()))
}

/// The axis video and text are concatenated along: the second to last axis of the text target,
/// or the first spatial axis of the video in video-only mode.
pub fn spatial_context(ctx: &BuildContext, inputs: &BuildInputs) -> Result<Dimension> {
    let dims = if ctx.params.use_language {
        let txt_tgt = require(inputs.txt_tgt.as_ref(), "txt_tgt")?;
        let dims = txt_tgt.shape().dims();
        dims.len().checked_sub(2).map(|i| dims[i].clone())
    } else {
        let vid = require(inputs.vid.as_ref(), "vid")?;
        vid.shape().dims().get(2).cloned()
    };
    dims.ok_or_else(|| Error::Config("inputs have no spatial context axis".to_string()))
}

/// Builds the full graph and its losses.
pub fn build(ctx: &mut BuildContext, inputs: &BuildInputs) -> Result<BuildOutput> {
    let params = ctx.params.clone();
    params.validate()?;
    let masks = Masks::from_inputs(inputs);
    let spatial_ctx = spatial_context(ctx, inputs)?;

    let result = ctx.scoped(&params.model_mode, |ctx| {
        let (src, vid_tgt) = ctx.scoped("input", |ctx| {
            input::encode(ctx, inputs, &masks, &spatial_ctx)
        })?;
        let out = ctx.scoped("body", |ctx| body::build_body(ctx, &src))?;
        let (frame_out, token_out) =
            ctx.scoped("output", |ctx| output::decode(ctx, &out, &spatial_ctx))?;
        let losses = ctx.scoped("loss", |ctx| {
            loss::compose(
                ctx,
                loss::LossInputs {
                    frame_out: frame_out.as_ref(),
                    token_out: token_out.as_ref(),
                    txt_tgt: inputs.txt_tgt.as_ref(),
                    txt_msk: inputs.txt_msk.as_ref(),
                    vid_tgt: vid_tgt.as_ref(),
                    masks: &masks,
                },
            )
        })?;

        let parts: Vec<&Variable> = losses.loss_list.iter().collect();
        let total_loss = sum_losses(&parts)?;
        Ok(BuildOutput {
            total_loss,
            loss_list: losses.loss_list,
            video_loss: losses.video_loss,
            accuracy: losses.accuracy,
            token_loss: losses.token_loss,
            frame_out,
            token_out,
        })
    });
    ctx.reset_attention_idx();

    let output = result?;
    info!(
        total_loss = output.total_loss.data.item().unwrap_or(f32::NAN),
        parameters = ctx.store.len(),
        "model built"
    );
    Ok(output)
}

fn sum_losses(parts: &[&Variable]) -> Result<Variable> {
    let mut iter = parts.iter();
    let first = iter
        .next()
        .ok_or_else(|| Error::Config("no loss was produced".to_string()))?;
    iter.try_fold((*first).clone(), |acc, part| acc.add(part))
}
