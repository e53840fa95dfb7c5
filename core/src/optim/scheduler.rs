//! Learning Rate Schedulers.
//!
//! The schedule feeds the `learning_rate` strategy of the optimizer pipeline.

/// A trait for learning rate schedulers.
pub trait LRScheduler {
    /// Calculates the learning rate for optimizer step `step`, counted from 1.
    fn get_lr(&self, step: u64) -> f32;
}

/// Linear Warmup with optional Linear Decay.
///
/// Increases LR linearly to `max_lr` over the first `warmup_steps` steps.
/// Then decays linearly to `min_lr` over `decay_steps` steps and stays there.
/// With `decay_steps == 0` the rate stays at `max_lr` after warmup.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearWarmup {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: u64,
    pub decay_steps: u64,
}

impl LinearWarmup {
    pub fn new(max_lr: f32, warmup_steps: u64, decay_steps: u64) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            decay_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }
}

impl LRScheduler for LinearWarmup {
    fn get_lr(&self, step: u64) -> f32 {
        if step < self.warmup_steps {
            return self.max_lr * (step as f32 / self.warmup_steps as f32);
        }
        if self.decay_steps == 0 {
            return self.max_lr;
        }
        let current_decay_step = step - self.warmup_steps;
        if current_decay_step >= self.decay_steps {
            return self.min_lr;
        }
        let progress = current_decay_step as f32 / self.decay_steps as f32;
        self.max_lr - (self.max_lr - self.min_lr) * progress
    }
}
