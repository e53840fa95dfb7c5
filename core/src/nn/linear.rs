//! Dense projections between named dimension groups.
//!
//! A projection replaces the `old` dimensions of its input with the `new` ones. The weight holds
//! `old ++ new`; output dimensions that share a name with an input dimension are carried under
//! their anonymous name inside the einsum and renamed back afterwards, so square projections such
//! as `features -> features` need no special casing.

use crate::autograd::Variable;
use crate::scope::BuildContext;
use crate::store::Init;
use crate::tensor::{Dimension, Shape};
use crate::Result;

/// Projects the `old` dimensions of `x` onto `new`.
///
/// Creates one weight in a fresh `linear{n}` scope, initialised with standard deviation
/// `1/sqrt(fan_in)`.
pub fn linear(
    ctx: &mut BuildContext,
    x: &Variable,
    old: &[Dimension],
    new: &[Dimension],
) -> Result<Variable> {
    for dim in old {
        x.shape().require(&dim.name)?;
    }
    let inner: Vec<Dimension> = new
        .iter()
        .map(|d| {
            if old.iter().any(|o| o.name == d.name) {
                d.anonymous()
            } else {
                d.clone()
            }
        })
        .collect();

    let fan_in: usize = old.iter().map(|d| d.size).product();
    let stddev = (fan_in.max(1) as f32).powf(-0.5);
    let weight_shape = Shape::new(old.iter().chain(&inner).cloned().collect())?;
    let weight = ctx.scoped("linear", |ctx| {
        ctx.parameter("weight", &weight_shape, Init::Normal { stddev })
    })?;

    let out_shape = x.shape().minus(old).extend(&inner)?;
    let mut out = Variable::einsum(&[x, &weight], &out_shape)?;
    for (outer, inner) in new.iter().zip(&inner) {
        if outer.name != inner.name {
            out = out.rename_dim(&inner.name, &outer.name)?;
        }
    }
    Ok(out)
}

/// Projects `old` onto the model's feature dimensions.
pub fn linear_to_features(
    ctx: &mut BuildContext,
    x: &Variable,
    old: &[Dimension],
) -> Result<Variable> {
    let features = ctx.params.feature_dims();
    linear(ctx, x, old, &features)
}

/// Projects the model's feature dimensions onto `new`.
pub fn linear_from_features(
    ctx: &mut BuildContext,
    x: &Variable,
    new: &[Dimension],
) -> Result<Variable> {
    let features = ctx.params.feature_dims();
    linear(ctx, x, &features, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParameter;
    use crate::store::ParameterStore;
    use crate::tensor::Tensor;
    use std::rc::Rc;

    fn ctx() -> BuildContext {
        BuildContext::new(Rc::new(ModelParameter::default()), ParameterStore::new())
    }

    #[test]
    fn test_linear_replaces_dims() {
        let mut ctx = ctx();
        let shape = Shape::new(vec![Dimension::new("batch", 2), Dimension::new("c", 3)]).unwrap();
        let x = Variable::new(Tensor::ones(shape));
        let y = linear(&mut ctx, &x, &[Dimension::new("c", 3)], &[Dimension::new("d", 5)]).unwrap();
        assert_eq!(y.shape().names(), vec!["batch", "d"]);
        assert_eq!(ctx.store.names(), vec!["linear0/weight"]);
    }

    #[test]
    fn test_square_projection_keeps_names() {
        let mut ctx = ctx();
        let features = ctx.params.feature_dims();
        let mut dims = vec![Dimension::new("batch", 2)];
        dims.extend(features.clone());
        let x = Variable::new(Tensor::ones(Shape::new(dims).unwrap()));
        let y = linear_to_features(&mut ctx, &x, &features).unwrap();
        assert_eq!(y.shape(), x.shape());

        let weight = ctx.store.get("linear0/weight").unwrap();
        assert_eq!(
            weight.shape().names(),
            vec!["heads", "features_per_head", "_heads", "_features_per_head"]
        );

        y.sum_all().unwrap().backward().unwrap();
        assert!(weight.grad().is_some());
        assert!(x.grad().is_some());
    }

    #[test]
    fn test_missing_input_dim_is_an_error() {
        let mut ctx = ctx();
        let x = Variable::new(Tensor::ones(
            Shape::new(vec![Dimension::new("batch", 2)]).unwrap(),
        ));
        assert!(linear(&mut ctx, &x, &[Dimension::new("c", 3)], &[Dimension::new("d", 1)]).is_err());
        assert!(ctx.store.is_empty());
    }
}
