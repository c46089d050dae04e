//! Optimizers.
//!
//! The optimizer only ever visits parameters that appear in the gradient map,
//! so frozen parameters are never touched and transfer-learning runs leave
//! the loaded trunk bit-identical.

use crate::{OptimizerKind, TrainError, TrainResult, TrainerConfig};
use ndarray::Array2;
use std::collections::HashMap;
use std::fmt::Debug;

/// Trait for optimizers.
pub trait Optimizer: Debug {
    /// Apply one update step to every parameter present in `gradients`.
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Array2<f64>>,
        gradients: &HashMap<String, Array2<f64>>,
    ) -> TrainResult<()>;

    /// Current learning rate.
    fn get_lr(&self) -> f64;

    /// Set the learning rate (used by schedulers).
    fn set_lr(&mut self, lr: f64);

    /// Flatten internal state for checkpointing.
    fn state_dict(&self) -> HashMap<String, Vec<f64>>;

    /// Restore internal state from a checkpoint.
    ///
    /// Shapes of per-parameter buffers are not known until the first `step`
    /// after loading, so implementations stash the flat values and rebuild
    /// the buffers lazily against the live parameter shapes.
    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>) -> TrainResult<()>;

    /// Name of the optimizer.
    fn name(&self) -> &'static str;
}

/// Build the optimizer a config asks for.
pub fn resolve_optimizer(config: &TrainerConfig) -> Box<dyn Optimizer> {
    match config.optimizer {
        OptimizerKind::Sgd => Box::new(SgdOptimizer::new(
            config.learning_rate,
            config.momentum,
            config.weight_decay,
        )),
        OptimizerKind::Adam => Box::new(AdamOptimizer::new(
            config.learning_rate,
            config.weight_decay,
            false,
        )),
        OptimizerKind::AdamW => Box::new(AdamOptimizer::new(
            config.learning_rate,
            config.weight_decay,
            true,
        )),
    }
}

fn restore_buffer(
    name: &str,
    shape: (usize, usize),
    pending: &mut HashMap<String, Vec<f64>>,
) -> TrainResult<Option<Array2<f64>>> {
    match pending.remove(name) {
        None => Ok(None),
        Some(values) => {
            let array = Array2::from_shape_vec(shape, values).map_err(|e| {
                TrainError::Optimizer(format!("restored buffer '{}' has wrong size: {}", name, e))
            })?;
            Ok(Some(array))
        }
    }
}

/// SGD with momentum and coupled (L2) weight decay.
#[derive(Debug)]
pub struct SgdOptimizer {
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: HashMap<String, Array2<f64>>,
    pending: HashMap<String, Vec<f64>>,
}

const VELOCITY_PREFIX: &str = "velocity_";

impl SgdOptimizer {
    /// Create an SGD optimizer.
    pub fn new(learning_rate: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl Optimizer for SgdOptimizer {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Array2<f64>>,
        gradients: &HashMap<String, Array2<f64>>,
    ) -> TrainResult<()> {
        for (name, grad) in gradients {
            let param = parameters.get_mut(name).ok_or_else(|| {
                TrainError::Optimizer(format!("gradient for unknown parameter '{}'", name))
            })?;
            if param.raw_dim() != grad.raw_dim() {
                return Err(TrainError::Optimizer(format!(
                    "shape mismatch for '{}': parameter {:?} vs gradient {:?}",
                    name,
                    param.shape(),
                    grad.shape()
                )));
            }

            let shape = (param.nrows(), param.ncols());
            if !self.velocity.contains_key(name) {
                let restored =
                    restore_buffer(&format!("{}{}", VELOCITY_PREFIX, name), shape, &mut self.pending)?;
                self.velocity
                    .insert(name.clone(), restored.unwrap_or_else(|| Array2::zeros(shape)));
            }

            // Coupled decay: fold the L2 term into the gradient.
            let effective = grad + &(&*param * self.weight_decay);
            let velocity = self
                .velocity
                .get_mut(name)
                .ok_or_else(|| TrainError::Optimizer(format!("missing velocity for '{}'", name)))?;
            *velocity = &*velocity * self.momentum + &effective;
            *param = &*param - &(&*velocity * self.learning_rate);
        }
        Ok(())
    }

    fn get_lr(&self) -> f64 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        self.velocity
            .iter()
            .map(|(name, buffer)| {
                (
                    format!("{}{}", VELOCITY_PREFIX, name),
                    buffer.iter().copied().collect(),
                )
            })
            .collect()
    }

    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>) -> TrainResult<()> {
        self.velocity.clear();
        self.pending = state;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SGD"
    }
}

/// Adam, with either coupled (L2) or decoupled (AdamW) weight decay.
#[derive(Debug)]
pub struct AdamOptimizer {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    decoupled_decay: bool,
    step_count: u64,
    first_moment: HashMap<String, Array2<f64>>,
    second_moment: HashMap<String, Array2<f64>>,
    pending: HashMap<String, Vec<f64>>,
}

const FIRST_MOMENT_PREFIX: &str = "m_";
const SECOND_MOMENT_PREFIX: &str = "v_";
const STEP_KEY: &str = "step";

impl AdamOptimizer {
    /// Create an Adam optimizer with default betas and epsilon.
    pub fn new(learning_rate: f64, weight_decay: f64, decoupled_decay: bool) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            decoupled_decay,
            step_count: 0,
            first_moment: HashMap::new(),
            second_moment: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl Optimizer for AdamOptimizer {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Array2<f64>>,
        gradients: &HashMap<String, Array2<f64>>,
    ) -> TrainResult<()> {
        self.step_count += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step_count as i32);

        for (name, grad) in gradients {
            let param = parameters.get_mut(name).ok_or_else(|| {
                TrainError::Optimizer(format!("gradient for unknown parameter '{}'", name))
            })?;
            if param.raw_dim() != grad.raw_dim() {
                return Err(TrainError::Optimizer(format!(
                    "shape mismatch for '{}': parameter {:?} vs gradient {:?}",
                    name,
                    param.shape(),
                    grad.shape()
                )));
            }

            let shape = (param.nrows(), param.ncols());
            if !self.first_moment.contains_key(name) {
                let restored_m =
                    restore_buffer(&format!("{}{}", FIRST_MOMENT_PREFIX, name), shape, &mut self.pending)?;
                let restored_v =
                    restore_buffer(&format!("{}{}", SECOND_MOMENT_PREFIX, name), shape, &mut self.pending)?;
                self.first_moment
                    .insert(name.clone(), restored_m.unwrap_or_else(|| Array2::zeros(shape)));
                self.second_moment
                    .insert(name.clone(), restored_v.unwrap_or_else(|| Array2::zeros(shape)));
            }

            let effective = if self.decoupled_decay {
                grad.clone()
            } else {
                grad + &(&*param * self.weight_decay)
            };

            let m = self
                .first_moment
                .get_mut(name)
                .ok_or_else(|| TrainError::Optimizer(format!("missing moment for '{}'", name)))?;
            *m = &*m * self.beta1 + &(&effective * (1.0 - self.beta1));
            let m_hat = &*m / bias1;

            let v = self
                .second_moment
                .get_mut(name)
                .ok_or_else(|| TrainError::Optimizer(format!("missing moment for '{}'", name)))?;
            *v = &*v * self.beta2 + &(effective.mapv(|g| g * g) * (1.0 - self.beta2));
            let v_hat = &*v / bias2;

            let epsilon = self.epsilon;
            let update = &m_hat / &v_hat.mapv(|x| x.sqrt() + epsilon);
            *param = &*param - &(&update * self.learning_rate);

            if self.decoupled_decay && self.weight_decay > 0.0 {
                *param = &*param * (1.0 - self.learning_rate * self.weight_decay);
            }
        }
        Ok(())
    }

    fn get_lr(&self) -> f64 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        let mut state: HashMap<String, Vec<f64>> = HashMap::new();
        state.insert(STEP_KEY.to_string(), vec![self.step_count as f64]);
        for (name, buffer) in &self.first_moment {
            state.insert(
                format!("{}{}", FIRST_MOMENT_PREFIX, name),
                buffer.iter().copied().collect(),
            );
        }
        for (name, buffer) in &self.second_moment {
            state.insert(
                format!("{}{}", SECOND_MOMENT_PREFIX, name),
                buffer.iter().copied().collect(),
            );
        }
        state
    }

    fn load_state_dict(&mut self, mut state: HashMap<String, Vec<f64>>) -> TrainResult<()> {
        if let Some(step) = state.remove(STEP_KEY) {
            self.step_count = step.first().copied().unwrap_or(0.0) as u64;
        }
        self.first_moment.clear();
        self.second_moment.clear();
        self.pending = state;
        Ok(())
    }

    fn name(&self) -> &'static str {
        if self.decoupled_decay {
            "AdamW"
        } else {
            "Adam"
        }
    }
}
