//! Backbone: `n_blocks` repetitions of `block_config` under a memory-reduction strategy.
//!
//! | Strategy     | Forward keeps                 | Backward                                   |
//! |--------------|-------------------------------|--------------------------------------------|
//! | `none`       | every activation              | plain reverse pass                         |
//! | `checkpoint` | block inputs and outputs      | replays each block from its input          |
//! | `revnet`     | coupling outputs              | reconstructs inputs, replays the block     |
//! | `momentum`   | coupling outputs              | reconstructs inputs, replays the block     |
//!
//! Replays run against a snapshot of the build context taken before the block was first built,
//! so they see the same parameter names.

use crate::autograd::checkpoint::recompute_grad;
use crate::autograd::reversible::{Coupling, RevState};
use crate::autograd::Variable;
use crate::config::MemoryReductionStrategy;
use crate::nn::{block_part_fn, embed};
use crate::scope::BuildContext;
use crate::Result;
use tracing::debug;

pub fn build_body(ctx: &mut BuildContext, src: &Variable) -> Result<Variable> {
    let params = ctx.params.clone();
    let mut src = src.clone();

    if params.use_initial_position_embedding {
        let features = params.feature_dims();
        let positional: Vec<_> = src.shape().minus(&features).dims()[1..].to_vec();
        for dim in positional {
            let mut dims = vec![dim];
            dims.extend(features.iter().cloned());
            let table = embed(ctx, "position_embedding", &dims)?;
            src = src.add(&table)?;
        }
    }

    let strategy = params.memory_reduction_strategy;
    debug!(%strategy, n_blocks = params.n_blocks, "building body");
    match strategy {
        MemoryReductionStrategy::None => {
            let mut out = src;
            for i in 0..params.n_blocks {
                for config in &params.block_config {
                    out = block_part_fn(ctx, config, &out, &i.to_string())?;
                }
            }
            Ok(out)
        }
        MemoryReductionStrategy::Checkpoint => {
            let mut out = src;
            for i in 0..params.n_blocks {
                for config in &params.block_config {
                    let (config, name) = (config.clone(), i.to_string());
                    let (value, replay) = ctx.replayable(&out, move |ctx, x| {
                        block_part_fn(ctx, &config, x, &name)
                    })?;
                    out = recompute_grad(&out, value, replay);
                }
            }
            Ok(out)
        }
        MemoryReductionStrategy::Revnet | MemoryReductionStrategy::Momentum => {
            let coupling = if strategy == MemoryReductionStrategy::Revnet {
                Coupling::RevNet
            } else {
                Coupling::Momentum {
                    alpha: params.momentumnet_alpha,
                }
            };
            let mut state = RevState::new(&src);
            for i in 0..params.n_blocks {
                for config in &params.block_config {
                    let (config, name) = (config.clone(), i.to_string());
                    let (fx, replay) =
                        ctx.replayable(coupling.block_input(&state), move |ctx, x| {
                            block_part_fn(ctx, &config, x, &name)
                        })?;
                    state = coupling.forward(&state, fx, replay)?;
                }
            }
            state.merge()
        }
    }
}
