use crate::autograd::Variable;
use crate::scope::BuildContext;
use crate::store::Init;
use crate::tensor::{Dimension, Shape};
use crate::Result;

/// A learned table over `dims`, created in a fresh `{name}{n}` scope.
///
/// Entries are drawn from `N(0, embedding_stddev)`.
pub fn embed(ctx: &mut BuildContext, name: &str, dims: &[Dimension]) -> Result<Variable> {
    let shape = Shape::new(dims.to_vec())?;
    let stddev = ctx.params.embedding_stddev;
    ctx.scoped(name, |ctx| {
        ctx.parameter("embedding", &shape, Init::Normal { stddev })
    })
}
