//! Naming and graph-construction context.
//!
//! Every parameter a model creates is named by the path of scopes it was created in. Scope names
//! are made unique by a counter per bare prefix: the first `scoped("body", ..)` is `body0`, the
//! second `body1`, and so on. Counters live in a [`NameScope`] owned by the [`BuildContext`], so
//! two contexts never interfere and a fresh context replays the same names.
//!
//! ```rust
//! use std::rc::Rc;
//! use vidtext::config::ModelParameter;
//! use vidtext::scope::BuildContext;
//! use vidtext::store::ParameterStore;
//!
//! let mut ctx = BuildContext::new(Rc::new(ModelParameter::default()), ParameterStore::new());
//! let inner = ctx.scoped("body", |ctx| Ok(ctx.scope.qualify("weight"))).unwrap();
//! assert_eq!(inner, "body0/weight");
//! assert_eq!(ctx.scope.next_name("body"), "body1");
//! ```

use crate::autograd::checkpoint::Replay;
use crate::autograd::Variable;
use crate::config::ModelParameter;
use crate::store::{Init, ParameterStore};
use crate::tensor::{Shape, Tensor};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Unique-name generator plus the current scope path.
#[derive(Debug, Clone, Default)]
pub struct NameScope {
    counters: HashMap<String, usize>,
    path: Vec<String>,
}

impl NameScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"{prefix}{n}"` where `n` counts previous requests for `prefix`, starting at 0.
    pub fn next_name(&mut self, prefix: &str) -> String {
        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        let name = format!("{prefix}{counter}");
        *counter += 1;
        name
    }

    pub fn push(&mut self, name: String) {
        self.path.push(name);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.path.pop()
    }

    /// Current path joined with `/`.
    pub fn path(&self) -> String {
        self.path.join("/")
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// `leaf` under the current path.
    pub fn qualify(&self, leaf: &str) -> String {
        if self.path.is_empty() {
            leaf.to_string()
        } else {
            format!("{}/{leaf}", self.path())
        }
    }

    /// Forgets every counter and the path.
    pub fn reset(&mut self) {
        self.counters.clear();
        self.path.clear();
    }
}

/// Everything graph construction needs: configuration, parameters, names and randomness.
///
/// Cloning produces a snapshot. Parameters are shared with the snapshot; names, the dropout
/// random stream and the attention counter are copied, so running the same code against a
/// snapshot reproduces the same graph.
#[derive(Clone)]
pub struct BuildContext {
    pub params: Rc<ModelParameter>,
    pub store: ParameterStore,
    pub scope: NameScope,
    init_rng: StdRng,
    rng: StdRng,
    attention_idx: usize,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("scope", &self.scope.path())
            .field("store", &self.store)
            .field("attention_idx", &self.attention_idx)
            .finish()
    }
}

impl BuildContext {
    pub fn new(params: Rc<ModelParameter>, store: ParameterStore) -> Self {
        Self::for_step(params, store, 0)
    }

    /// Context for training step `step`; dropout masks differ between steps, initial parameter
    /// values do not.
    pub fn for_step(params: Rc<ModelParameter>, store: ParameterStore, step: u64) -> Self {
        let init_rng = StdRng::seed_from_u64(params.seed);
        let rng = StdRng::seed_from_u64(params.seed.wrapping_add(step).wrapping_add(1));
        Self {
            params,
            store,
            scope: NameScope::new(),
            init_rng,
            rng,
            attention_idx: 0,
        }
    }

    /// Runs `f` inside a uniquely named child scope.
    ///
    /// Errors returned by `f` are wrapped in [`Error::Scope`] carrying the unique name.
    pub fn scoped<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut BuildContext) -> Result<T>,
    ) -> Result<T> {
        let unique = self.scope.next_name(name);
        debug!(scope = %self.scope.qualify(&unique), "entering scope");
        self.scope.push(unique.clone());
        let result = f(self);
        self.scope.pop();
        result.map_err(|source| Error::Scope {
            scope: unique,
            source: Box::new(source),
        })
    }

    /// The parameter `name` under the current scope, created with `init` on first use.
    pub fn parameter(&mut self, name: &str, shape: &Shape, init: Init) -> Result<Variable> {
        let full = self.scope.qualify(name);
        self.store.get_or_create(&full, shape, init, &mut self.init_rng)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Inverted dropout: zeroes elements with probability `rate` and rescales the rest.
    ///
    /// Identity outside training or for a zero rate.
    pub fn dropout(&mut self, x: &Variable, rate: f32) -> Result<Variable> {
        if !self.params.train || rate <= 0.0 {
            return Ok(x.clone());
        }
        if rate >= 1.0 {
            return Err(Error::Config(format!("dropout rate {rate} must be below 1")));
        }
        let keep = 1.0 / (1.0 - rate);
        let rng = &mut self.rng;
        let mask = Tensor::from_fn(x.shape().clone(), |_| {
            if rng.random::<f32>() < rate {
                0.0
            } else {
                keep
            }
        });
        x.mul(&Variable::constant(mask))
    }

    /// Returns the current attention index and advances it.
    pub fn next_attention_idx(&mut self) -> usize {
        let idx = self.attention_idx;
        self.attention_idx += 1;
        idx
    }

    pub fn attention_idx(&self) -> usize {
        self.attention_idx
    }

    pub fn reset_attention_idx(&mut self) {
        self.attention_idx = 0;
    }

    /// Runs `f` on a detached copy of `x` and returns its value together with a [`Replay`] that
    /// recomputes it against a snapshot of this context taken before `f` ran.
    ///
    /// `self` advances exactly as if `f` had been called directly, so later names are unaffected.
    pub fn replayable<F>(&mut self, x: &Variable, f: F) -> Result<(Tensor, Replay)>
    where
        F: Fn(&mut BuildContext, &Variable) -> Result<Variable> + 'static,
    {
        let snapshot = self.clone();
        let output = f(self, &x.detach())?.data;
        let replay: Replay = Rc::new(move |input: &Variable| -> Result<Variable> {
            let mut ctx = snapshot.clone();
            f(&mut ctx, input)
        });
        Ok((output, replay))
    }
}

/// Arguments of one layer call: the context, the current tensor and the layer's name suffixes.
///
/// For a layer string `norm-shift-scale` the extras are `["shift", "scale"]`.
pub struct BlockArgs<'a> {
    pub ctx: &'a mut BuildContext,
    pub tensor: Variable,
    pub extras: Vec<String>,
}

impl<'a> BlockArgs<'a> {
    pub fn new(ctx: &'a mut BuildContext, tensor: Variable, extras: Vec<String>) -> Self {
        Self {
            ctx,
            tensor,
            extras,
        }
    }

    pub fn has(&self, extra: &str) -> bool {
        self.extras.iter().any(|e| e == extra)
    }

    /// Same context and extras, different tensor.
    pub fn with_tensor(&mut self, tensor: Variable) -> BlockArgs<'_> {
        BlockArgs {
            ctx: self.ctx,
            tensor,
            extras: self.extras.clone(),
        }
    }

    pub fn params(&self) -> &ModelParameter {
        &self.ctx.params
    }
}
