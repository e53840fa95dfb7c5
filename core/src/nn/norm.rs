use crate::autograd::Variable;
use crate::scope::BlockArgs;
use crate::store::Init;
use crate::tensor::Shape;
use crate::Result;

const NORM_EPSILON: f32 = 1e-5;

/// Layer normalization over the feature dimensions.
///
/// Formula: `y = (x - mean) / sqrt(var + eps)`, followed by `* scale` and `+ shift` when the layer
/// string carries those extras (`norm-shift-scale`). Both are per-feature parameters.
pub fn norm(args: &mut BlockArgs<'_>) -> Result<Variable> {
    let features = args.params().feature_dims();
    let x = &args.tensor;
    let reduced = x.shape().minus(&features);
    let centered = x.sub(&x.reduce_mean(&reduced)?)?;
    let variance = centered.square().reduce_mean(&reduced)?;
    let mut out = centered.mul(&variance.add_scalar(NORM_EPSILON).rsqrt())?;

    let feature_shape = Shape::new(features)?;
    if args.has("scale") {
        let scale = args.ctx.parameter("scale", &feature_shape, Init::Ones)?;
        out = out.mul(&scale)?;
    }
    if args.has("shift") {
        let shift = args.ctx.parameter("shift", &feature_shape, Init::Zeros)?;
        out = out.add(&shift)?;
    }
    Ok(out)
}

/// Multiplies by a learned scalar initialised to zero, so a freshly built block starts as the
/// identity of its skip connection.
pub fn rezero(args: &mut BlockArgs<'_>) -> Result<Variable> {
    let gate = args.ctx.parameter("rezero", &Shape::scalar(), Init::Zeros)?;
    args.tensor.mul(&gate)
}
