//! Multi-head dot-product attention along one context dimension.
//!
//! # Which dimension?
//!
//! Activations carry several context axes (`sequence`, and for video the spatial axes). Each
//! attention layer attends along exactly one of them. The candidates are the dimensions of the
//! input that are neither the batch dimension nor feature dimensions, in order; the layer picks
//! `candidates[attention_idx % len]` and advances the context's attention index, so consecutive
//! attention layers cycle through the axes.
//!
//! # Layout
//!
//! Keys and values have the attended dimension `d` renamed to its anonymous twin `_d`, which makes
//! the logits `[..., d, heads, _d]`. Softmax runs over `_d`. Attention along `sequence` is causal:
//! position `i` only sees positions `j <= i`.

use super::linear::linear;
use crate::autograd::Variable;
use crate::config::{BATCH, SEQUENCE};
use crate::scope::BlockArgs;
use crate::tensor::{Dimension, Shape, Tensor};
use crate::{Error, Result};
use tracing::trace;

const MASKED_LOGIT: f32 = -1e9;

pub fn attention(args: &mut BlockArgs<'_>) -> Result<Variable> {
    let features = args.params().feature_dims();
    let key_dim = args.params().key_dim();
    let x = args.tensor.clone();

    let candidates: Vec<Dimension> = x
        .shape()
        .minus(&features)
        .dims()
        .iter()
        .filter(|d| d.name != BATCH)
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Err(Error::Config(format!(
            "attention needs a context dimension besides batch and features, got {}",
            x.shape()
        )));
    }
    let idx = args.ctx.next_attention_idx();
    let dim = candidates[idx % candidates.len()].clone();
    let anonymous = dim.anonymous();
    trace!(dim = %dim, idx, "attention");

    let q = linear(args.ctx, &x, &features, &features)?;
    let k = linear(args.ctx, &x, &features, &features)?.anonymize(&dim)?;
    let v = linear(args.ctx, &x, &features, &features)?.anonymize(&dim)?;

    let logit_shape = q.shape().minus(&[key_dim.clone()]).extend(&[anonymous.clone()])?;
    let mut logits =
        Variable::einsum(&[&q, &k], &logit_shape)?.mul_scalar((key_dim.size as f32).powf(-0.5));
    if dim.name == SEQUENCE {
        logits = logits.add(&Variable::constant(causal_bias(&dim, &anonymous)?))?;
    }
    let weights = logits.softmax(&anonymous.name)?;
    let context = Variable::einsum(&[&weights, &v], x.shape())?;
    linear(args.ctx, &context, &features, &features)
}

/// `[dim, _dim]` additive mask: 0 where `j <= i`, a large negative number elsewhere.
fn causal_bias(dim: &Dimension, anonymous: &Dimension) -> Result<Tensor> {
    let n = dim.size;
    let shape = Shape::new(vec![dim.clone(), anonymous.clone()])?;
    Ok(Tensor::from_fn(shape, |flat| {
        let (i, j) = (flat / n, flat % n);
        if j <= i {
            0.0
        } else {
            MASKED_LOGIT
        }
    }))
}
