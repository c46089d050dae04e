//! Model collaborator contract.
//!
//! Network architectures (message-passing stacks, attention blocks) live
//! outside this crate and are consumed through [`PropertyModel`]: a forward
//! pass producing one output row per sample, a backward pass producing
//! gradients for the trainable parameters, and enough parameter plumbing for
//! checkpointing and transfer learning. [`MlpModel`] is a small concrete
//! implementation used by tests and as a reference for the contract.

use crate::{TrainError, TrainResult};
use ndarray::{Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

/// Trait for trainable property-prediction models.
///
/// Output layout is dictated by the task: regression heads emit a point
/// estimate column (plus a log-std column when robust); classification heads
/// emit class logits (plus per-class log-variance columns when robust).
pub trait PropertyModel {
    /// Forward pass. Returns one output row per input row.
    fn forward(&self, inputs: &ArrayView2<f64>) -> TrainResult<Array2<f64>>;

    /// Backward pass: gradients of the loss w.r.t. each *trainable*
    /// parameter, given the gradient w.r.t. the model output. Frozen
    /// parameters must not appear in the result.
    fn backward(
        &self,
        inputs: &ArrayView2<f64>,
        grad_output: &ArrayView2<f64>,
    ) -> TrainResult<HashMap<String, Array2<f64>>>;

    /// All parameters, frozen or not.
    fn parameters(&self) -> &HashMap<String, Array2<f64>>;

    /// Mutable access to all parameters.
    fn parameters_mut(&mut self) -> &mut HashMap<String, Array2<f64>>;

    /// Names of the parameters the optimizer may update.
    fn trainable_parameters(&self) -> Vec<String>;

    /// Switch between training and evaluation behavior (dropout etc.).
    /// Models without mode-dependent behavior can ignore this.
    fn set_training(&mut self, training: bool) {
        let _ = training;
    }

    /// Freeze every parameter. Used by transfer learning before the output
    /// head is replaced.
    fn freeze_all(&mut self);

    /// Replace the output head with a freshly initialized layer of
    /// `output_dim` columns, sized for a new task. The new head is trainable.
    fn replace_output_head(&mut self, output_dim: usize, seed: u64) -> TrainResult<()>;

    /// Number of output columns currently produced.
    fn output_dim(&self) -> usize;

    /// Total number of trainable scalar parameters.
    fn num_trainable_parameters(&self) -> usize {
        self.trainable_parameters()
            .iter()
            .filter_map(|name| self.parameters().get(name))
            .map(|p| p.len())
            .sum()
    }

    /// Flatten parameters for checkpointing.
    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        self.parameters()
            .iter()
            .map(|(name, param)| (name.clone(), param.iter().copied().collect()))
            .collect()
    }

    /// Restore parameters from a checkpoint. Sizes must match exactly.
    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>) -> TrainResult<()> {
        let parameters = self.parameters_mut();

        for (name, values) in state {
            let param = parameters.get_mut(&name).ok_or_else(|| {
                TrainError::Model(format!("parameter '{}' not found in model", name))
            })?;
            if param.len() != values.len() {
                return Err(TrainError::Model(format!(
                    "parameter '{}' size mismatch: expected {}, got {}",
                    name,
                    param.len(),
                    values.len()
                )));
            }
            for (p, v) in param.iter_mut().zip(values.iter()) {
                *p = *v;
            }
        }

        Ok(())
    }
}

/// Two-layer perceptron with a ReLU trunk and a linear output head.
///
/// Parameters: `trunk_weight` (in x hidden), `trunk_bias` (1 x hidden),
/// `out_weight` (hidden x out), `out_bias` (1 x out).
#[derive(Debug, Clone)]
pub struct MlpModel {
    parameters: HashMap<String, Array2<f64>>,
    frozen: HashSet<String>,
    input_dim: usize,
    hidden_dim: usize,
    output_dim: usize,
}

const TRUNK_WEIGHT: &str = "trunk_weight";
const TRUNK_BIAS: &str = "trunk_bias";
const OUT_WEIGHT: &str = "out_weight";
const OUT_BIAS: &str = "out_bias";

fn uniform_init(rows: usize, cols: usize, limit: f64, rng: &mut impl Rng) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

impl MlpModel {
    /// Create a model with seeded uniform initialization. Distinct seeds give
    /// distinct ensemble members.
    pub fn new(input_dim: usize, hidden_dim: usize, output_dim: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

        let trunk_limit = (6.0 / (input_dim + hidden_dim) as f64).sqrt();
        let out_limit = (6.0 / (hidden_dim + output_dim) as f64).sqrt();

        let mut parameters = HashMap::new();
        parameters.insert(
            TRUNK_WEIGHT.to_string(),
            uniform_init(input_dim, hidden_dim, trunk_limit, &mut rng),
        );
        parameters.insert(TRUNK_BIAS.to_string(), Array2::zeros((1, hidden_dim)));
        parameters.insert(
            OUT_WEIGHT.to_string(),
            uniform_init(hidden_dim, output_dim, out_limit, &mut rng),
        );
        parameters.insert(OUT_BIAS.to_string(), Array2::zeros((1, output_dim)));

        Self {
            parameters,
            frozen: HashSet::new(),
            input_dim,
            hidden_dim,
            output_dim,
        }
    }

    /// Input feature dimension.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Hidden layer width.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn param(&self, name: &str) -> TrainResult<&Array2<f64>> {
        self.parameters
            .get(name)
            .ok_or_else(|| TrainError::Model(format!("parameter '{}' not found", name)))
    }

    /// Trunk pre-activations for a batch.
    fn trunk_preact(&self, inputs: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        if inputs.ncols() != self.input_dim {
            return Err(TrainError::Model(format!(
                "expected {} input features, got {}",
                self.input_dim,
                inputs.ncols()
            )));
        }
        Ok(inputs.dot(self.param(TRUNK_WEIGHT)?) + self.param(TRUNK_BIAS)?)
    }
}

impl PropertyModel for MlpModel {
    fn forward(&self, inputs: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        let hidden = self.trunk_preact(inputs)?.mapv(|v| v.max(0.0));
        Ok(hidden.dot(self.param(OUT_WEIGHT)?) + self.param(OUT_BIAS)?)
    }

    fn backward(
        &self,
        inputs: &ArrayView2<f64>,
        grad_output: &ArrayView2<f64>,
    ) -> TrainResult<HashMap<String, Array2<f64>>> {
        let preact = self.trunk_preact(inputs)?;
        let hidden = preact.mapv(|v| v.max(0.0));

        let mut gradients = HashMap::new();

        if !self.frozen.contains(OUT_WEIGHT) {
            gradients.insert(OUT_WEIGHT.to_string(), hidden.t().dot(grad_output));
        }
        if !self.frozen.contains(OUT_BIAS) {
            gradients.insert(
                OUT_BIAS.to_string(),
                grad_output.sum_axis(Axis(0)).insert_axis(Axis(0)),
            );
        }

        let trunk_trainable =
            !self.frozen.contains(TRUNK_WEIGHT) || !self.frozen.contains(TRUNK_BIAS);
        if trunk_trainable {
            let grad_hidden = grad_output.dot(&self.param(OUT_WEIGHT)?.t());
            let grad_preact = &grad_hidden * &preact.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });

            if !self.frozen.contains(TRUNK_WEIGHT) {
                gradients.insert(TRUNK_WEIGHT.to_string(), inputs.t().dot(&grad_preact));
            }
            if !self.frozen.contains(TRUNK_BIAS) {
                gradients.insert(
                    TRUNK_BIAS.to_string(),
                    grad_preact.sum_axis(Axis(0)).insert_axis(Axis(0)),
                );
            }
        }

        Ok(gradients)
    }

    fn parameters(&self) -> &HashMap<String, Array2<f64>> {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut HashMap<String, Array2<f64>> {
        &mut self.parameters
    }

    fn trainable_parameters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parameters
            .keys()
            .filter(|name| !self.frozen.contains(*name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn freeze_all(&mut self) {
        self.frozen = self.parameters.keys().cloned().collect();
    }

    fn replace_output_head(&mut self, output_dim: usize, seed: u64) -> TrainResult<()> {
        if output_dim == 0 {
            return Err(TrainError::Model("output head must have at least one column".into()));
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let limit = (6.0 / (self.hidden_dim + output_dim) as f64).sqrt();

        self.parameters.insert(
            OUT_WEIGHT.to_string(),
            uniform_init(self.hidden_dim, output_dim, limit, &mut rng),
        );
        self.parameters
            .insert(OUT_BIAS.to_string(), Array2::zeros((1, output_dim)));
        self.frozen.remove(OUT_WEIGHT);
        self.frozen.remove(OUT_BIAS);
        self.output_dim = output_dim;
        Ok(())
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_forward_shape() {
        let model = MlpModel::new(3, 8, 2, 0);
        let inputs = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let out = model.forward(&inputs.view()).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
    }

    #[test]
    fn test_backward_covers_all_parameters() {
        let model = MlpModel::new(3, 4, 1, 0);
        let inputs = arr2(&[[1.0, -2.0, 3.0]]);
        let grad_output = arr2(&[[1.0]]);

        let grads = model.backward(&inputs.view(), &grad_output.view()).unwrap();
        assert_eq!(grads.len(), 4);
        assert_eq!(grads["trunk_weight"].shape(), &[3, 4]);
        assert_eq!(grads["out_weight"].shape(), &[4, 1]);
    }

    #[test]
    fn test_backward_numerical_gradient() {
        // Check dL/d(out_weight) against a finite difference for L = sum(out).
        let mut model = MlpModel::new(2, 3, 1, 1);
        let inputs = arr2(&[[0.5, -1.5], [2.0, 0.25]]);
        let grad_output = arr2(&[[1.0], [1.0]]);

        let grads = model.backward(&inputs.view(), &grad_output.view()).unwrap();
        let analytic = grads["out_weight"][[0, 0]];

        let eps = 1e-6;
        let base: f64 = model.forward(&inputs.view()).unwrap().sum();
        model.parameters_mut().get_mut("out_weight").unwrap()[[0, 0]] += eps;
        let bumped: f64 = model.forward(&inputs.view()).unwrap().sum();

        let numeric = (bumped - base) / eps;
        assert!((analytic - numeric).abs() < 1e-4);
    }

    #[test]
    fn test_distinct_seeds_give_distinct_weights() {
        let a = MlpModel::new(4, 4, 1, 1);
        let b = MlpModel::new(4, 4, 1, 2);
        assert_ne!(a.parameters()["trunk_weight"], b.parameters()["trunk_weight"]);
    }

    #[test]
    fn test_freeze_and_replace_head() {
        let mut model = MlpModel::new(3, 4, 2, 0);
        model.freeze_all();
        assert!(model.trainable_parameters().is_empty());

        model.replace_output_head(5, 9).unwrap();
        assert_eq!(model.output_dim(), 5);
        assert_eq!(
            model.trainable_parameters(),
            vec!["out_bias".to_string(), "out_weight".to_string()]
        );

        let grads = model
            .backward(
                &arr2(&[[1.0, 2.0, 3.0]]).view(),
                &Array2::ones((1, 5)).view(),
            )
            .unwrap();
        assert!(grads.contains_key("out_weight"));
        assert!(!grads.contains_key("trunk_weight"));
    }

    #[test]
    fn test_state_dict_round_trip() {
        let model = MlpModel::new(3, 4, 1, 5);
        let state = model.state_dict();

        let mut other = MlpModel::new(3, 4, 1, 6);
        other.load_state_dict(state).unwrap();
        assert_eq!(model.parameters()["trunk_weight"], other.parameters()["trunk_weight"]);
        assert_eq!(model.parameters()["out_bias"], other.parameters()["out_bias"]);
    }

    #[test]
    fn test_load_state_dict_size_mismatch() {
        let mut model = MlpModel::new(3, 4, 1, 0);
        let mut state = HashMap::new();
        state.insert("trunk_weight".to_string(), vec![0.0; 3]);
        assert!(model.load_state_dict(state).is_err());
    }
}
