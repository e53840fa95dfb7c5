//! Gradient transforms.
//!
//! A [`Strategy`] maps the current gradient of one parameter to a new one. Strategies are chained
//! by a [`Pipeline`](super::Pipeline) and selected by name, optionally with a threshold:
//! `"adam"`, `"l2norm_clip:1.0"`, `"learning_rate"`.
//!
//! | Name                      | Effect                                                         |
//! |---------------------------|----------------------------------------------------------------|
//! | `adam`                    | debiased first moment over debiased RMS of the second moment   |
//! | `novograd`                | per-element first moment of a layer-normalised gradient        |
//! | `sm3`                     | one accumulator per axis, cover by their minimum               |
//! | `sgd`                     | gradient unchanged                                             |
//! | `adaptive_clip:T`         | caps `‖g‖ / ‖w‖` at `T`                                        |
//! | `l2norm_clip:T`           | caps `‖g‖` at `T`                                              |
//! | `global_l2norm_clip:T`    | caps the norm of all gradients of the step together at `T`     |
//! | `value_clip:T`            | clamps every element to `[-T, T]`                              |
//! | `gradient_centralisation` | `g - mean(g)`                                                  |
//! | `weight_centralisation`   | `g + mean(w)`                                                  |
//! | `learning_rate`           | `g * lr`                                                       |

use super::OptimizerCtx;
use crate::tensor::{Dimension, Shape, Tensor};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

/// `1 / max(sqrt(x), 1e-5)`.
pub fn opt_rsqrt(x: f32) -> f32 {
    1.0 / x.sqrt().max(1e-5)
}

/// `1 / (1 - beta^step)`.
pub fn debias_momentum(beta: f32, step: u64) -> f32 {
    1.0 / (1.0 - beta.powi(step.min(i32::MAX as u64) as i32))
}

/// `lhs * weight + rhs * (1 - weight)`.
pub fn weighted_add(lhs: &Tensor, rhs: &Tensor, weight: f32) -> Result<Tensor> {
    Ok(lhs.zip_with(rhs, |l, r| l * weight + r * (1.0 - weight))?)
}

fn square_sum(t: &Tensor) -> f32 {
    t.map(|v| v * v).sum_all()
}

fn mean(t: &Tensor) -> f32 {
    t.sum_all() / t.size().max(1) as f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    Adam,
    Novograd,
    Sm3,
    Sgd,
    AdaptiveClip(f32),
    L2NormClip(f32),
    GlobalL2NormClip(f32),
    ValueClip(f32),
    GradientCentralisation,
    WeightCentralisation,
    LearningRate,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let threshold = || -> Result<f32> {
            let arg = arg.ok_or_else(|| Error::MissingArgument(name.to_string()))?;
            arg.trim().parse().map_err(|_| Error::InvalidThreshold {
                strategy: name.to_string(),
                value: arg.to_string(),
            })
        };
        let strategy = match name {
            "adam" => Strategy::Adam,
            "novograd" => Strategy::Novograd,
            "sm3" => Strategy::Sm3,
            "sgd" => Strategy::Sgd,
            "adaptive_clip" => Strategy::AdaptiveClip(threshold()?),
            "l2norm_clip" => Strategy::L2NormClip(threshold()?),
            "global_l2norm_clip" => Strategy::GlobalL2NormClip(threshold()?),
            "value_clip" => Strategy::ValueClip(threshold()?),
            "gradient_centralisation" => Strategy::GradientCentralisation,
            "weight_centralisation" => Strategy::WeightCentralisation,
            "learning_rate" => Strategy::LearningRate,
            other => return Err(Error::UnknownStrategy(other.to_string())),
        };
        if arg.is_some() && strategy.threshold().is_none() {
            return Err(Error::Config(format!("strategy '{name}' takes no argument")));
        }
        Ok(strategy)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Adam => "adam",
            Strategy::Novograd => "novograd",
            Strategy::Sm3 => "sm3",
            Strategy::Sgd => "sgd",
            Strategy::AdaptiveClip(_) => "adaptive_clip",
            Strategy::L2NormClip(_) => "l2norm_clip",
            Strategy::GlobalL2NormClip(_) => "global_l2norm_clip",
            Strategy::ValueClip(_) => "value_clip",
            Strategy::GradientCentralisation => "gradient_centralisation",
            Strategy::WeightCentralisation => "weight_centralisation",
            Strategy::LearningRate => "learning_rate",
        };
        match self.threshold() {
            Some(t) => write!(f, "{name}:{t}"),
            None => f.write_str(name),
        }
    }
}

impl Strategy {
    pub fn threshold(&self) -> Option<f32> {
        match *self {
            Strategy::AdaptiveClip(t)
            | Strategy::L2NormClip(t)
            | Strategy::GlobalL2NormClip(t)
            | Strategy::ValueClip(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the transformed gradient. State updates are queued on `ctx`.
    pub fn apply(&self, ctx: &mut OptimizerCtx<'_>) -> Result<Tensor> {
        trace!(strategy = %self, var = ctx.var_name, "applying strategy");
        match *self {
            Strategy::Adam => adam(ctx),
            Strategy::Novograd => novograd(ctx),
            Strategy::Sm3 => sm3(ctx),
            Strategy::Sgd => Ok(ctx.grad.clone()),
            Strategy::AdaptiveClip(clip) => {
                let grad_norm = square_sum(&ctx.grad).sqrt().max(1e-6);
                let weight_norm = square_sum(ctx.var).sqrt().max(1e-3);
                if grad_norm / weight_norm > clip {
                    Ok(ctx.grad.mul_scalar(weight_norm / grad_norm * clip))
                } else {
                    Ok(ctx.grad.clone())
                }
            }
            Strategy::L2NormClip(clip) => {
                let scale = clip / square_sum(&ctx.grad).max(clip.powi(-2)).sqrt();
                Ok(ctx.grad.mul_scalar(scale))
            }
            Strategy::GlobalL2NormClip(clip) => {
                let reciprocal = ctx.step.global_norm_reciprocal(clip);
                Ok(ctx.grad.mul_scalar(clip * reciprocal))
            }
            Strategy::ValueClip(clip) => Ok(ctx.grad.map(|v| v.clamp(-clip, clip))),
            Strategy::GradientCentralisation => Ok(ctx.grad.add_scalar(-mean(&ctx.grad))),
            Strategy::WeightCentralisation => Ok(ctx.grad.add_scalar(mean(ctx.var))),
            Strategy::LearningRate => Ok(ctx.grad.mul_scalar(ctx.learning_rate)),
        }
    }
}

fn adam(ctx: &mut OptimizerCtx<'_>) -> Result<Tensor> {
    let shape = ctx.var.shape().clone();
    let (p2_name, p2) = ctx.aux("exp_avg_p2", &shape);
    let (p1_name, p1) = ctx.aux("exp_avg_p1", &shape);

    let p2 = weighted_add(&p2, &ctx.grad.map(|v| v * v), ctx.beta2)?;
    let p1 = weighted_add(&p1, &ctx.grad, ctx.beta1)?;

    let denominator = p2
        .mul_scalar(debias_momentum(ctx.beta2, ctx.step_count))
        .map(opt_rsqrt);
    let update = (&denominator * &p1)?.mul_scalar(debias_momentum(ctx.beta1, ctx.step_count));

    ctx.defer(p2_name, p2);
    ctx.defer(p1_name, p1);
    Ok(update)
}

fn novograd(ctx: &mut OptimizerCtx<'_>) -> Result<Tensor> {
    let shape = ctx.var.shape().clone();
    let (p1_name, p1) = ctx.aux("exp_avg_p1", &shape);
    let (p2_name, p2) = ctx.aux("exp_avg_p2", &Shape::scalar());
    let p2 = p2.item()?;
    let (beta1, beta2) = (ctx.beta1, ctx.beta2);

    let old_scale = opt_rsqrt(p2);
    let p1 = p1.zip_with(&ctx.grad, |m, g| beta1 * m + g * old_scale)?;
    let p2 = p2 * beta2 + square_sum(&ctx.grad) * (1.0 - beta2);

    let new_scale = opt_rsqrt(p2 * debias_momentum(beta2, ctx.step_count));
    let update = p1.zip_with(&ctx.grad, |m, g| beta1 * m + g * new_scale)?;

    ctx.assign(p1_name, p1);
    ctx.assign(p2_name, Tensor::scalar(p2));
    Ok(update)
}

fn sm3(ctx: &mut OptimizerCtx<'_>) -> Result<Tensor> {
    let dims: Vec<Dimension> = ctx.var.shape().dims().to_vec();
    let squared = ctx.grad.map(|v| v * v);

    if dims.is_empty() {
        let (name, buffer) = ctx.aux("dim0", &Shape::scalar());
        let accumulated = (&buffer + &squared)?;
        let update = ctx.grad.zip_with(&accumulated, |g, a| g * opt_rsqrt(a))?;
        ctx.defer(name, accumulated);
        return Ok(update);
    }

    let mut buffers = Vec::with_capacity(dims.len());
    let mut cover: Option<Tensor> = None;
    for (i, dim) in dims.iter().enumerate() {
        let (name, buffer) = ctx.aux(&format!("dim{i}"), &Shape::new(vec![dim.clone()])?);
        cover = Some(match cover {
            None => buffer,
            Some(acc) => acc.minimum(&buffer)?,
        });
        buffers.push((name, dim.clone()));
    }
    let cover = cover.unwrap_or_else(|| Tensor::zeros(ctx.var.shape().clone()));
    let accumulated = (&cover + &squared)?;

    for (name, dim) in buffers {
        let reduced = accumulated.reduce_max(&Shape::new(vec![dim])?)?;
        ctx.defer(name, reduced);
    }
    Ok(ctx.grad.zip_with(&accumulated, |g, a| g * opt_rsqrt(a))?)
}
