//! Optimizer pipeline.
//!
//! An [`Optimizer`] step runs the configured [`Pipeline`] once per trainable parameter and
//! subtracts the result from the parameter:
//!
//! ```text
//! for each parameter w with gradient g:
//!     update = strategy_n(... strategy_1(g))
//!     w' = w - update
//! ```
//!
//! Strategies with state (`adam`, `novograd`, `sm3`) read their accumulators from the
//! [`ParameterStore`]'s auxiliary slots and queue new values as [`PendingUpdate`]s. `Assign`
//! updates are written as soon as their parameter's chain finishes; `Deferred` ones, and the
//! parameters themselves, only after every parameter of the step was processed. Nothing a
//! strategy reads therefore changes within a step.
//!
//! Cross-parameter reductions live on the [`StepContext`], shared by every parameter of a step.

pub mod scheduler;
pub mod strategy;

pub use scheduler::{LRScheduler, LinearWarmup};
pub use strategy::Strategy;

use crate::config::ModelParameter;
use crate::store::ParameterStore;
use crate::tensor::{Shape, Tensor};
use crate::{Error, Result};
use once_cell::unsync::OnceCell;
use rayon::prelude::*;
use tracing::{debug, info};

/// A queued write to an auxiliary optimizer slot.
#[derive(Debug, Clone)]
pub enum PendingUpdate {
    /// Written after every parameter of the step was processed.
    Deferred { name: String, value: Tensor },
    /// Written right after the owning parameter's chain.
    Assign { name: String, value: Tensor },
}

impl PendingUpdate {
    pub fn name(&self) -> &str {
        match self {
            PendingUpdate::Deferred { name, .. } | PendingUpdate::Assign { name, .. } => name,
        }
    }
}

/// State shared by every parameter of one optimizer step.
#[derive(Debug)]
pub struct StepContext {
    gradients: Vec<(String, Tensor)>,
    pub step_count: u64,
    pub learning_rate: f32,
    global_norm_reciprocal: OnceCell<f32>,
}

impl StepContext {
    pub fn new(gradients: Vec<(String, Tensor)>, step_count: u64, learning_rate: f32) -> Self {
        Self {
            gradients,
            step_count,
            learning_rate,
            global_norm_reciprocal: OnceCell::new(),
        }
    }

    pub fn gradients(&self) -> &[(String, Tensor)] {
        &self.gradients
    }

    /// `rsqrt(max(sum of every squared gradient element, clip^-2))`.
    ///
    /// Computed on first use and reused for the rest of the step; later calls ignore `clip`.
    pub fn global_norm_reciprocal(&self, clip: f32) -> f32 {
        *self.global_norm_reciprocal.get_or_init(|| {
            let total: f32 = self
                .gradients
                .par_iter()
                .map(|(_, g)| g.data().iter().map(|v| v * v).sum::<f32>())
                .sum();
            let reciprocal = 1.0 / total.max(clip.powi(-2)).sqrt();
            debug!(total, reciprocal, "global gradient norm");
            reciprocal
        })
    }

    /// The memoised reciprocal, if a strategy asked for it this step.
    pub fn cached_global_norm_reciprocal(&self) -> Option<f32> {
        self.global_norm_reciprocal.get().copied()
    }
}

/// Everything a strategy sees while transforming one parameter's gradient.
pub struct OptimizerCtx<'a> {
    /// The gradient as transformed by the strategies so far.
    pub grad: Tensor,
    pub var_name: &'a str,
    pub var: &'a Tensor,
    pub beta1: f32,
    pub beta2: f32,
    pub learning_rate: f32,
    pub step_count: u64,
    pub updates: Vec<PendingUpdate>,
    pub step: &'a StepContext,
    store: &'a ParameterStore,
}

impl<'a> OptimizerCtx<'a> {
    pub fn new(
        step: &'a StepContext,
        store: &'a ParameterStore,
        var_name: &'a str,
        var: &'a Tensor,
        grad: Tensor,
        betas: (f32, f32),
    ) -> Self {
        Self {
            grad,
            var_name,
            var,
            beta1: betas.0,
            beta2: betas.1,
            learning_rate: step.learning_rate,
            step_count: step.step_count,
            updates: Vec::new(),
            step,
            store,
        }
    }

    /// Name and current value of the accumulator `slot` of this parameter, zeros if unset.
    pub fn aux(&self, slot: &str, shape: &Shape) -> (String, Tensor) {
        let name = format!("{}/{slot}", self.var_name);
        let value = self.store.aux_or_zeros(&name, shape);
        (name, value)
    }

    pub fn defer(&mut self, name: String, value: Tensor) {
        self.updates.push(PendingUpdate::Deferred { name, value });
    }

    pub fn assign(&mut self, name: String, value: Tensor) {
        self.updates.push(PendingUpdate::Assign { name, value });
    }
}

/// An ordered chain of strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    strategies: Vec<Strategy>,
}

impl Pipeline {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self { strategies }
    }

    /// Parses every entry; the first malformed one fails the whole pipeline.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let strategies = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<Strategy>>>()?;
        Ok(Self::new(strategies))
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Runs every strategy in order and returns the final gradient.
    pub fn apply(&self, ctx: &mut OptimizerCtx<'_>) -> Result<Tensor> {
        for strategy in &self.strategies {
            ctx.grad = strategy.apply(ctx)?;
        }
        Ok(ctx.grad.clone())
    }
}

/// Summary of one optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub learning_rate: f32,
    pub parameters: usize,
    pub global_norm_reciprocal: Option<f32>,
}

pub struct Optimizer {
    pipeline: Pipeline,
    beta1: f32,
    beta2: f32,
    schedule: Box<dyn LRScheduler>,
    step_count: u64,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("pipeline", &self.pipeline)
            .field("beta1", &self.beta1)
            .field("beta2", &self.beta2)
            .field("step_count", &self.step_count)
            .finish()
    }
}

impl Optimizer {
    pub fn new(pipeline: Pipeline, beta1: f32, beta2: f32, schedule: Box<dyn LRScheduler>) -> Self {
        Self {
            pipeline,
            beta1,
            beta2,
            schedule,
            step_count: 0,
        }
    }

    /// Pipeline, betas and a warmup/decay schedule from the model configuration.
    pub fn from_params(params: &ModelParameter) -> Result<Self> {
        params.validate()?;
        if !(0.0..1.0).contains(&params.beta1) || !(0.0..1.0).contains(&params.beta2) {
            return Err(Error::Config(format!(
                "betas must lie in [0, 1), got ({}, {})",
                params.beta1, params.beta2
            )));
        }
        let pipeline = Pipeline::parse(&params.optimizer)?;
        let schedule = LinearWarmup::new(
            params.learning_rate,
            params.warmup_steps as u64,
            params.learning_rate_decay_steps as u64,
        )
        .with_min_lr(params.minimum_learning_rate);
        Ok(Self::new(
            pipeline,
            params.beta1,
            params.beta2,
            Box::new(schedule),
        ))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Number of completed steps.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Resumes counting after `step_count` completed steps, e.g. after loading a checkpoint.
    pub fn set_step_count(&mut self, step_count: u64) {
        self.step_count = step_count;
    }

    /// Updates every parameter of `store` that has a gradient, then commits all queued state.
    pub fn step(&mut self, store: &ParameterStore) -> Result<StepReport> {
        let step_count = self.step_count + 1;
        let learning_rate = self.schedule.get_lr(step_count);

        let mut params = Vec::new();
        let mut gradients = Vec::new();
        for (name, var) in store.parameters() {
            match var.grad() {
                Some(grad) => {
                    let grad = grad.broadcast_to(var.shape())?;
                    gradients.push((name.clone(), grad));
                    params.push(var.data.clone());
                }
                None => debug!(param = %name, "no gradient, skipping"),
            }
        }
        let step = StepContext::new(gradients, step_count, learning_rate);

        let mut deferred = Vec::new();
        let mut new_values = Vec::with_capacity(params.len());
        for ((name, grad), value) in step.gradients().iter().zip(&params) {
            let mut ctx = OptimizerCtx::new(
                &step,
                store,
                name,
                value,
                grad.clone(),
                (self.beta1, self.beta2),
            );
            let update = self.pipeline.apply(&mut ctx)?;
            new_values.push((name.clone(), (value - &update)?));
            for pending in ctx.updates {
                match pending {
                    PendingUpdate::Assign { name, value } => store.set_aux(&name, value),
                    deferred_update => deferred.push(deferred_update),
                }
            }
        }

        commit(store, deferred);
        for (name, value) in new_values {
            store.set_value(&name, value)?;
        }
        self.step_count = step_count;

        let report = StepReport {
            step: step_count,
            learning_rate,
            parameters: params.len(),
            global_norm_reciprocal: step.cached_global_norm_reciprocal(),
        };
        info!(
            step = report.step,
            learning_rate = report.learning_rate,
            parameters = report.parameters,
            "optimizer step"
        );
        Ok(report)
    }
}

/// Writes queued auxiliary state.
pub fn commit(store: &ParameterStore, updates: Vec<PendingUpdate>) {
    for update in updates {
        match update {
            PendingUpdate::Deferred { name, value } | PendingUpdate::Assign { name, value } => {
                store.set_aux(&name, value)
            }
        }
    }
}
