//! Learning-rate schedulers.

use crate::optimizer::Optimizer;
use std::collections::HashMap;
use std::fmt::Debug;

/// Trait for learning-rate schedulers.
///
/// `step` is called once per epoch, after the validation pass.
pub trait LrScheduler: Debug {
    /// Advance one epoch and push the new rate into the optimizer.
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    /// Learning rate the scheduler currently prescribes.
    fn get_lr(&self) -> f64;

    /// Scalar state for checkpointing. Milestones and decay factor come from
    /// the config, so only the counters need to survive a restart.
    fn state_dict(&self) -> HashMap<String, f64>;

    /// Restore scalar state from a checkpoint.
    fn load_state_dict(&mut self, state: HashMap<String, f64>);
}

/// Multiplies the learning rate by `gamma` at each milestone epoch.
#[derive(Debug, Clone)]
pub struct MultiStepLrScheduler {
    initial_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    current_epoch: usize,
    current_lr: f64,
}

impl MultiStepLrScheduler {
    /// Create a scheduler starting from `initial_lr`.
    pub fn new(initial_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            initial_lr,
            milestones,
            gamma,
            current_epoch: 0,
            current_lr: initial_lr,
        }
    }
}

impl LrScheduler for MultiStepLrScheduler {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.current_epoch += 1;
        if self.milestones.contains(&self.current_epoch) {
            self.current_lr *= self.gamma;
        }
        optimizer.set_lr(self.current_lr);
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn state_dict(&self) -> HashMap<String, f64> {
        let mut state = HashMap::new();
        state.insert("current_epoch".to_string(), self.current_epoch as f64);
        state.insert("current_lr".to_string(), self.current_lr);
        state
    }

    fn load_state_dict(&mut self, state: HashMap<String, f64>) {
        if let Some(&epoch) = state.get("current_epoch") {
            self.current_epoch = epoch as usize;
        }
        if let Some(&lr) = state.get("current_lr") {
            self.current_lr = lr;
        } else {
            self.current_lr = self.initial_lr;
        }
    }
}
