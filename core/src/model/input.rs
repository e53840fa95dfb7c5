//! Input encoder: raw video frames and token ids into the feature space.

use super::{require, BuildInputs, Masks};
use crate::autograd::Variable;
use crate::config::COLOR_CHANNELS;
use crate::nn::{block_part_fn, embed, linear_to_features};
use crate::scope::BuildContext;
use crate::tensor::{DType, Dimension, Shape, Tensor};
use crate::{Error, Result};
use tracing::debug;

/// Encodes every enabled modality and concatenates them along `spatial_ctx`, video first.
///
/// Returns the source tensor and, with video, the target frames.
pub fn encode(
    ctx: &mut BuildContext,
    inputs: &BuildInputs,
    masks: &Masks,
    spatial_ctx: &Dimension,
) -> Result<(Variable, Option<Tensor>)> {
    let params = ctx.params.clone();
    let video = if params.use_video {
        let vid = require(inputs.vid.as_ref(), "vid")?;
        Some(encode_video(ctx, vid, masks)?)
    } else {
        None
    };
    let text = if params.use_language {
        let txt_src = require(inputs.txt_src.as_ref(), "txt_src")?;
        Some(encode_text(ctx, txt_src)?)
    } else {
        None
    };

    match (video, text) {
        (Some((src, tgt)), Some(txt)) => {
            let combined = Variable::concat(&[&src, &txt], &spatial_ctx.name)?;
            Ok((combined, Some(tgt)))
        }
        (Some((src, tgt)), None) => Ok((src, Some(tgt))),
        (None, Some(txt)) => Ok((txt, None)),
        (None, None) => Err(Error::Config(
            "at least one of use_video and use_language must be set".to_string(),
        )),
    }
}

/// Splits every value into `fold_count` base-`2^bit_fold_value` digits, least significant first,
/// concatenated along `color_channels`.
pub fn bit_fold(vid: &Tensor, bit_fold_value: u32, fold_count: usize) -> Result<Tensor> {
    let base = 2f32.powi(bit_fold_value as i32);
    let vid = vid.cast(DType::I64);
    let digits: Vec<Tensor> = (0..fold_count)
        .map(|i| {
            vid.floordiv(base.powi(i as i32))
                .modulo(base)
                .cast(DType::U8)
        })
        .collect();
    let refs: Vec<&Tensor> = digits.iter().collect();
    Ok(Tensor::concat(&refs, COLOR_CHANNELS)?)
}

/// Next-frame framing along the time axis (axis 1): `(src, tgt) = (vid[..T-1], vid[1..])`.
pub fn split_frames(vid: &Tensor) -> Result<(Tensor, Tensor)> {
    let time = vid
        .shape()
        .dims()
        .get(1)
        .cloned()
        .ok_or_else(|| Error::Config(format!("video {} has no time axis", vid.shape())))?;
    if time.size < 2 {
        return Err(Error::Config(format!(
            "video needs at least two frames, got {}",
            time.size
        )));
    }
    let src = vid.slice(&time.name, 0, time.size - 1)?;
    let tgt = vid.slice(&time.name, 1, time.size)?;
    Ok((src, tgt))
}

fn encode_video(
    ctx: &mut BuildContext,
    vid: &Tensor,
    masks: &Masks,
) -> Result<(Variable, Tensor)> {
    let params = ctx.params.clone();
    let vid = vid.cast(DType::F32);
    let mut vid = ctx
        .dropout(&Variable::constant(vid), params.input_dropout)?
        .data;

    if params.use_bit_fold_input_pipeline {
        vid = bit_fold(&vid, params.bit_fold_value, params.fold_count)?;
    }
    if !params.use_discrete_video_loss {
        vid = vid.cast(DType::F32).mul_scalar(1.0 / 255.0);
    }
    let channels = vid
        .shape()
        .dims()
        .last()
        .cloned()
        .ok_or_else(|| Error::Config("video has no channel axis".to_string()))?;
    let (mut src, mut tgt) = split_frames(&vid)?;

    if params.use_discrete_video_loss {
        src = src
            .cast(DType::F32)
            .mul_scalar(1.0 / (params.color_quantization_value as f32 - 1.0));
        tgt = per_head_layout(&params, &tgt)?;
    }
    debug!(src = %src.shape(), tgt = %tgt.shape(), "video frames split");

    let mut src = Variable::constant(src);
    if params.use_empty_frame_embedding {
        let frame_dims = vid.shape().dims()[2..].to_vec();
        let vid_msk = Variable::constant(masks.vid_src.clone());
        let cat_msk = Variable::constant(masks.cat_src.clone());
        let empty = embed(ctx, "empty_frame_embedding", &frame_dims)?;
        src = src.weighted_add(&empty, &vid_msk)?;
        let empty = embed(ctx, "empty_frame_embedding", &frame_dims)?;
        src = src.weighted_add(&empty, &cat_msk)?;
    }

    let mut src = linear_to_features(ctx, &src, &[channels])?;
    for (i, config) in params.input_block_config.iter().enumerate() {
        src = block_part_fn(ctx, config, &src, &format!("vid_inp{i}"))?;
    }
    Ok((src, tgt))
}

/// `[batch, time, ...]` into `[batch, sequence_per_head, heads, ...]`.
pub(crate) fn per_head_layout(
    params: &crate::config::ModelParameter,
    tensor: &Tensor,
) -> Result<Tensor> {
    let dims = tensor.shape().dims();
    if dims.len() < 2 {
        return Err(Error::Config(format!(
            "{} has no time axis to split per head",
            tensor.shape()
        )));
    }
    let mut layout = vec![
        dims[0].clone(),
        params.sequence_per_head_dim(dims[1].size)?,
        params.heads_dim(),
    ];
    layout.extend(dims[2..].iter().cloned());
    Ok(tensor.reshape(Shape::new(layout)?)?)
}

fn encode_text(ctx: &mut BuildContext, txt_src: &Tensor) -> Result<Variable> {
    let params = ctx.params.clone();
    let vocab = params.vocab_dim();
    let intermediate = params.token_embedding_dim();

    let table = embed(ctx, "token_embedding", &[vocab.clone(), intermediate.clone()])?;
    let one_hot = Variable::constant(txt_src.one_hot(&vocab)?);
    let embedded_shape = txt_src.shape().extend(std::slice::from_ref(&intermediate))?;
    let txt = Variable::einsum(&[&table, &one_hot], &embedded_shape)?;
    let txt = ctx.dropout(&txt, params.input_dropout)?;

    let mut txt = linear_to_features(ctx, &txt, &[params.token_patch_dim(), intermediate])?;
    for (i, config) in params.input_block_config.iter().enumerate() {
        txt = block_part_fn(ctx, config, &txt, &format!("lang_inp{i}"))?;
    }
    Ok(txt)
}
