use super::activation::Activation;
use super::linear::linear;
use crate::autograd::Variable;
use crate::scope::BlockArgs;
use crate::Result;

/// Position-wise MLP: `features -> [heads, intermediate] -> activation -> features`.
///
/// The activation is chosen by the layer's extras and defaults to GELU.
pub fn feed_forward(args: &mut BlockArgs<'_>) -> Result<Variable> {
    let features = args.params().feature_dims();
    let intermediate = args.params().intermediate_dims();
    let activation = Activation::from_extras(&args.extras);

    let hidden = linear(args.ctx, &args.tensor, &features, &intermediate)?;
    let hidden = activation.apply(&hidden);
    linear(args.ctx, &hidden, &intermediate, &features)
}
