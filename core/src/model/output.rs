//! Output decoder: splits the backbone output along the spatial context axis into the token
//! part and the frame part and projects each into its target space.

use crate::autograd::Variable;
use crate::config::ModelParameter;
use crate::nn::{block_part_fn, embed, linear, linear_from_features};
use crate::scope::BuildContext;
use crate::tensor::{Dimension, Shape};
use crate::{Error, Result};

/// `(token_positions, frame_positions)` of a spatial context axis of length `total`.
///
/// The token part is the first `language_token_patch` positions when language is enabled, the
/// frame part is everything after it when video is enabled. Together they must cover `total`
/// exactly.
pub fn partition(params: &ModelParameter, total: usize) -> Result<(usize, usize)> {
    let tokens = if params.use_language {
        params.language_token_patch
    } else {
        0
    };
    let frames = if params.use_video {
        total.saturating_sub(tokens)
    } else {
        0
    };
    if tokens + frames != total || (params.use_video && frames == 0) {
        return Err(Error::Config(format!(
            "spatial context of length {total} does not split into {tokens} token positions \
             and a non-empty frame part"
        )));
    }
    Ok((tokens, frames))
}

/// Returns `(frame_out, token_out)`.
pub fn decode(
    ctx: &mut BuildContext,
    out: &Variable,
    spatial_ctx: &Dimension,
) -> Result<(Option<Variable>, Option<Variable>)> {
    let params = ctx.params.clone();
    let total = out.shape().require(&spatial_ctx.name)?.size;
    let (tokens, _) = partition(&params, total)?;

    let token_out = if params.use_language {
        Some(decode_tokens(ctx, out.slice(&spatial_ctx.name, 0, tokens)?)?)
    } else {
        None
    };
    let frame_out = if params.use_video {
        Some(decode_frames(ctx, out.slice(&spatial_ctx.name, tokens, total)?)?)
    } else {
        None
    };
    Ok((frame_out, token_out))
}

fn decode_tokens(ctx: &mut BuildContext, mut token_out: Variable) -> Result<Variable> {
    let params = ctx.params.clone();
    for (i, config) in params.output_block_config.iter().enumerate() {
        token_out = block_part_fn(ctx, config, &token_out, &format!("lang_out{i}"))?;
    }

    let new = [params.token_patch_dim(), params.vocab_dim()];
    let mut old = params.feature_dims();
    if params.split_vocab {
        let heads = params.heads_dim();
        old = old
            .into_iter()
            .map(|d| if d.name == heads.name { d.anonymous() } else { d })
            .collect();
        token_out = token_out.anonymize(&heads)?;
    }
    let mut table_dims = old.clone();
    table_dims.extend(new.iter().cloned());
    let table = embed(ctx, "output_embedding", &table_dims)?;
    let logits_shape = token_out.shape().minus(&old).extend(&new)?;
    Variable::einsum(&[&token_out, &table], &logits_shape)
}

fn decode_frames(ctx: &mut BuildContext, mut frame_out: Variable) -> Result<Variable> {
    let params = ctx.params.clone();
    for (i, config) in params.output_block_config.iter().enumerate() {
        frame_out = block_part_fn(ctx, config, &frame_out, &format!("vid_out{i}"))?;
    }

    if !params.use_discrete_video_loss {
        let colors = linear_from_features(ctx, &frame_out, &[params.color_channel_dim()])?;
        return Ok(colors.sigmoid());
    }

    let dims = frame_out.shape().dims().to_vec();
    if dims.len() < 4 {
        return Err(Error::Config(format!(
            "frame output {} is too small for the per-head layout",
            frame_out.shape()
        )));
    }
    let (lead, trailing) = dims.split_at(dims.len() - 2);
    let features = Dimension::new("features", trailing[0].size * trailing[1].size);
    let mut merged = lead.to_vec();
    merged.push(features.clone());
    let frame_out = frame_out.reshape(Shape::new(merged)?)?;

    let mut per_head = vec![
        lead[0].clone(),
        params.sequence_per_head_dim(lead[1].size)?,
        params.heads_dim(),
    ];
    per_head.extend(lead[2..].iter().cloned());
    per_head.push(features.clone());
    let frame_out = frame_out.reshape(Shape::new(per_head)?)?;

    linear(
        ctx,
        &frame_out,
        &[features],
        &[params.color_channel_dim(), params.discrete_color_dim()],
    )
}
