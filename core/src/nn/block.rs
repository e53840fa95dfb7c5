//! Interpretation of [`BlockConfig`]s.
//!
//! A block is a list of layer strings applied in order, e.g.
//! `["norm-shift-scale", "feed_forward-gelu"]`. The part before the first `-` picks the
//! [`LayerKind`]; the remaining parts are handed to the layer as extras. With `skip` set the block
//! input is added to its output, but only for strategies that keep a plain residual stream: the
//! reversible couplings already carry the residual themselves.

use super::{activate, attention, feed_forward, linear, norm, rezero};
use crate::autograd::Variable;
use crate::config::BlockConfig;
use crate::scope::{BlockArgs, BuildContext};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Norm,
    FeedForward,
    Attention,
    Activation,
    Rezero,
    Linear,
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "norm" => Ok(LayerKind::Norm),
            "feed_forward" => Ok(LayerKind::FeedForward),
            "attention" => Ok(LayerKind::Attention),
            "activation" => Ok(LayerKind::Activation),
            "rezero" => Ok(LayerKind::Rezero),
            "linear" => Ok(LayerKind::Linear),
            other => Err(Error::Config(format!("unknown layer '{other}'"))),
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Norm => "norm",
            LayerKind::FeedForward => "feed_forward",
            LayerKind::Attention => "attention",
            LayerKind::Activation => "activation",
            LayerKind::Rezero => "rezero",
            LayerKind::Linear => "linear",
        };
        f.write_str(name)
    }
}

impl LayerKind {
    /// Splits `norm-shift-scale` into the kind and its extras.
    pub fn parse_layer(layer: &str) -> Result<(LayerKind, Vec<String>)> {
        let mut parts = layer.split('-');
        let kind = parts.next().unwrap_or_default().parse()?;
        Ok((kind, parts.map(str::to_string).collect()))
    }

    pub fn apply(self, args: &mut BlockArgs<'_>) -> Result<Variable> {
        match self {
            LayerKind::Norm => norm(args),
            LayerKind::FeedForward => feed_forward(args),
            LayerKind::Attention => attention(args),
            LayerKind::Activation => activate(args),
            LayerKind::Rezero => rezero(args),
            LayerKind::Linear => {
                let features = args.params().feature_dims();
                linear(args.ctx, &args.tensor, &features, &features)
            }
        }
    }
}

/// Applies every layer of `config` to `x` inside a `{name}_{n}` scope.
///
/// Each layer runs in its own `{kind}_{n}` scope, so two norms in one block get distinct
/// parameters.
pub fn block_part_fn(
    ctx: &mut BuildContext,
    config: &BlockConfig,
    x: &Variable,
    name: &str,
) -> Result<Variable> {
    let skip = config.skip && ctx.params.memory_reduction_strategy.uses_skip_connections();
    ctx.scoped(&format!("{name}_"), |ctx| {
        let mut out = x.clone();
        for layer in &config.layer {
            let (kind, extras) = LayerKind::parse_layer(layer)?;
            debug!(layer = %layer, scope = %ctx.scope.path(), "building layer");
            out = ctx.scoped(&format!("{kind}_"), |ctx| {
                kind.apply(&mut BlockArgs::new(ctx, out, extras))
            })?;
        }
        if skip {
            out = out.add(x)?;
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryReductionStrategy, ModelParameter, SEQUENCE};
    use crate::store::ParameterStore;
    use crate::tensor::{Dimension, Shape, Tensor};
    use std::rc::Rc;

    fn ctx(strategy: MemoryReductionStrategy) -> BuildContext {
        let params = ModelParameter {
            memory_reduction_strategy: strategy,
            ..Default::default()
        };
        BuildContext::new(Rc::new(params), ParameterStore::new())
    }

    fn input(ctx: &BuildContext) -> Variable {
        let mut dims = vec![Dimension::new("batch", 2), Dimension::new(SEQUENCE, 3)];
        dims.extend(ctx.params.feature_dims());
        Variable::new(Tensor::from_fn(Shape::new(dims).unwrap(), |i| {
            (i % 5) as f32 * 0.1
        }))
    }

    #[test]
    fn test_parse_layer() {
        let (kind, extras) = LayerKind::parse_layer("norm-shift-scale").unwrap();
        assert_eq!(kind, LayerKind::Norm);
        assert_eq!(extras, vec!["shift", "scale"]);
        assert!(LayerKind::parse_layer("conv").is_err());
    }

    #[test]
    fn test_block_parameter_names() {
        let mut ctx = ctx(MemoryReductionStrategy::None);
        let x = input(&ctx);
        let config = BlockConfig::new(["norm-scale", "norm-shift"], false);
        block_part_fn(&mut ctx, &config, &x, "0").unwrap();
        assert_eq!(
            ctx.store.names(),
            vec!["0_0/norm_0/scale", "0_0/norm_1/shift"]
        );
    }

    #[test]
    fn test_skip_only_for_plain_strategies() {
        let config = BlockConfig::new(["rezero"], true);
        for (strategy, expect_identity) in [
            (MemoryReductionStrategy::None, true),
            (MemoryReductionStrategy::Checkpoint, true),
            (MemoryReductionStrategy::Revnet, false),
            (MemoryReductionStrategy::Momentum, false),
        ] {
            let mut ctx = ctx(strategy);
            let x = input(&ctx);
            let y = block_part_fn(&mut ctx, &config, &x, "0").unwrap();
            let same = y.data.data() == x.data.data();
            assert_eq!(same, expect_identity, "{strategy:?}");
        }
    }

    #[test]
    fn test_unknown_layer_is_scoped() {
        let mut ctx = ctx(MemoryReductionStrategy::None);
        let x = input(&ctx);
        let config = BlockConfig::new(["norm", "convolution"], false);
        let err = block_part_fn(&mut ctx, &config, &x, "3").unwrap_err();
        assert_eq!(err.scope_path(), vec!["3_0"]);
        assert!(matches!(err.root(), Error::Config(_)));
    }
}
