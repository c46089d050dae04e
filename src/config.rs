//! Configuration types for single runs and ensembles.
//!
//! All choices that the original workflow dispatched on strings ("L1"/"L2",
//! "SGD"/"Adam") are tagged enums here, resolved once at configuration time.
//! There is no process-wide configuration state; every component receives the
//! config it needs through its constructor.

use crate::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Kind of prediction task for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Scalar regression target.
    Regression,
    /// Categorical target with `n_classes` classes.
    Classification,
}

/// Loss family selected at configuration time.
///
/// Combined with [`TrainerConfig::robust`] this determines the concrete
/// criterion: robust variants are negative log-likelihoods under a predicted
/// aleatoric uncertainty, plain variants ignore the uncertainty head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Absolute-error loss (Laplace likelihood when robust).
    L1,
    /// Squared-error loss (Gaussian likelihood when robust).
    L2,
    /// Cross-entropy on class logits.
    CrossEntropy,
}

impl FromStr for LossKind {
    type Err = TrainError;

    fn from_str(s: &str) -> TrainResult<Self> {
        match s {
            "L1" => Ok(Self::L1),
            "L2" => Ok(Self::L2),
            "CSE" | "CrossEntropy" => Ok(Self::CrossEntropy),
            other => Err(TrainError::Config(format!(
                "unknown loss '{}', expected L1, L2 or CSE",
                other
            ))),
        }
    }
}

/// Optimizer family selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// SGD with momentum and coupled weight decay.
    Sgd,
    /// Adam with coupled (L2) weight decay.
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = TrainError;

    fn from_str(s: &str) -> TrainResult<Self> {
        match s {
            "SGD" => Ok(Self::Sgd),
            "Adam" => Ok(Self::Adam),
            "AdamW" => Ok(Self::AdamW),
            other => Err(TrainError::Config(format!(
                "unknown optimizer '{}', expected SGD, Adam or AdamW",
                other
            ))),
        }
    }
}

/// Identity of one ensemble member: `fold_id` partitions the data, `run_id`
/// distinguishes members trained on the same fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Data-fold index.
    pub fold_id: usize,
    /// Ensemble-member index within the fold.
    pub run_id: usize,
}

impl RunIdentity {
    /// Create a new run identity.
    pub fn new(fold_id: usize, run_id: usize) -> Self {
        Self { fold_id, run_id }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.fold_id, self.run_id)
    }
}

/// How a run's model/optimizer/normalizer are initialized before the epoch
/// loop begins. Selected once; each variant yields a fully-initialized run
/// state rather than mutating components piecemeal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStrategy {
    /// Construct everything from scratch.
    Fresh,
    /// Restore the "latest" checkpoint of this (fold, run) verbatim and
    /// continue from its epoch counter.
    Resume,
    /// Load model weights only from an external checkpoint (possibly trained
    /// on a different dataset); optimizer, scheduler and normalizer are fresh.
    FineTune(PathBuf),
    /// Load model weights from an external checkpoint, freeze everything
    /// except a newly-sized output head, and train only that head.
    Transfer(PathBuf),
}

/// Configuration for a single training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Task type for the target.
    pub task: TaskType,
    /// Loss family.
    pub loss: LossKind,
    /// Whether the model predicts its own aleatoric uncertainty.
    pub robust: bool,
    /// Number of classes (classification only).
    pub n_classes: usize,
    /// Optimizer family.
    pub optimizer: OptimizerKind,
    /// Learning rate.
    pub learning_rate: f64,
    /// Momentum (SGD only).
    pub momentum: f64,
    /// Weight decay.
    pub weight_decay: f64,
    /// Number of epochs to run (added to the start epoch when resuming).
    pub epochs: usize,
    /// Epochs at which the learning rate is multiplied by `gamma`.
    pub milestones: Vec<usize>,
    /// Multiplicative learning-rate decay factor.
    pub gamma: f64,
    /// Directory holding the "latest" and "best" checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Gzip-compress checkpoint files.
    pub gzip_checkpoints: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            task: TaskType::Regression,
            loss: LossKind::L1,
            robust: true,
            n_classes: 2,
            optimizer: OptimizerKind::AdamW,
            learning_rate: 3e-4,
            momentum: 0.9,
            weight_decay: 1e-6,
            epochs: 100,
            milestones: vec![50, 150, 250],
            gamma: 0.5,
            checkpoint_dir: PathBuf::from("models"),
            gzip_checkpoints: false,
        }
    }
}

impl TrainerConfig {
    /// Number of output columns the model head must produce.
    ///
    /// Regression: 1, or 2 when robust (point estimate + log-std).
    /// Classification: `n_classes` logits, doubled when robust for the
    /// per-class log-variance head.
    pub fn output_dim(&self) -> usize {
        match self.task {
            TaskType::Regression => {
                if self.robust {
                    2
                } else {
                    1
                }
            }
            TaskType::Classification => {
                if self.robust {
                    2 * self.n_classes
                } else {
                    self.n_classes
                }
            }
        }
    }

    /// Check internal consistency. Fails fast on loss/task mismatches so a
    /// bad configuration never reaches the epoch loop.
    pub fn validate(&self) -> TrainResult<()> {
        match (self.task, self.loss) {
            (TaskType::Regression, LossKind::CrossEntropy) => Err(TrainError::Config(
                "cross-entropy loss requires a classification task".into(),
            )),
            (TaskType::Classification, LossKind::L1) | (TaskType::Classification, LossKind::L2) => {
                Err(TrainError::Config(
                    "L1/L2 losses require a regression task".into(),
                ))
            }
            _ => Ok(()),
        }?;

        if self.task == TaskType::Classification && self.n_classes < 2 {
            return Err(TrainError::Config(
                "classification requires at least 2 classes".into(),
            ));
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(TrainError::Config(format!(
                "learning rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if self.gamma <= 0.0 {
            return Err(TrainError::Config(format!(
                "scheduler gamma must be positive, got {}",
                self.gamma
            )));
        }
        Ok(())
    }
}

/// Configuration for training and evaluating an ensemble on one fold.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Per-run training configuration, shared by all members.
    pub trainer: TrainerConfig,
    /// Number of independently trained members.
    pub ensemble_size: usize,
    /// Data-fold index shared by all members.
    pub fold_id: usize,
    /// Explicit run id, honored when `ensemble_size == 1` so members of a
    /// larger ensemble can be trained as separate processes.
    pub run_id: usize,
    /// Base RNG seed; member seeds are derived from it per run id.
    pub base_seed: u64,
    /// Initialization strategy applied to every member.
    pub init: InitStrategy,
    /// Use the test set for validation when no validation loader is given.
    ///
    /// Off by default: checkpoint selection against the test set biases the
    /// reported "best" metrics, so this must be an explicit opt-in. When
    /// engaged, the only unbiased model is the one after the final epoch of a
    /// pre-committed epoch count.
    pub use_test_as_validation: bool,
}

impl EnsembleConfig {
    /// Create an ensemble config with defaults for the remaining fields.
    pub fn new(trainer: TrainerConfig, ensemble_size: usize, fold_id: usize) -> Self {
        Self {
            trainer,
            ensemble_size,
            fold_id,
            run_id: 0,
            base_seed: 0,
            init: InitStrategy::Fresh,
            use_test_as_validation: false,
        }
    }

    /// Run ids of the ensemble members. A single-member ensemble honors the
    /// externally supplied `run_id`; larger ensembles number members 0..N.
    pub fn member_run_ids(&self) -> Vec<usize> {
        if self.ensemble_size == 1 {
            vec![self.run_id]
        } else {
            (0..self.ensemble_size).collect()
        }
    }

    /// RNG seed for one member.
    pub fn member_seed(&self, run_id: usize) -> u64 {
        self.base_seed.wrapping_add(run_id as u64)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> TrainResult<()> {
        if self.ensemble_size == 0 {
            return Err(TrainError::Config("ensemble size must be positive".into()));
        }
        self.trainer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_kind_parsing() {
        assert_eq!("L1".parse::<LossKind>().unwrap(), LossKind::L1);
        assert_eq!("L2".parse::<LossKind>().unwrap(), LossKind::L2);
        assert_eq!("CSE".parse::<LossKind>().unwrap(), LossKind::CrossEntropy);
        assert!("Huber".parse::<LossKind>().is_err());
    }

    #[test]
    fn test_optimizer_kind_parsing() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!(
            "AdamW".parse::<OptimizerKind>().unwrap(),
            OptimizerKind::AdamW
        );
        assert!("RMSprop".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_output_dim() {
        let mut config = TrainerConfig::default();
        assert_eq!(config.output_dim(), 2); // robust regression

        config.robust = false;
        assert_eq!(config.output_dim(), 1);

        config.task = TaskType::Classification;
        config.loss = LossKind::CrossEntropy;
        config.n_classes = 3;
        assert_eq!(config.output_dim(), 3);

        config.robust = true;
        assert_eq!(config.output_dim(), 6);
    }

    #[test]
    fn test_validate_rejects_loss_task_mismatch() {
        let config = TrainerConfig {
            task: TaskType::Classification,
            loss: LossKind::L1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainerConfig {
            task: TaskType::Regression,
            loss: LossKind::CrossEntropy,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_member_run_ids() {
        let mut config = EnsembleConfig::new(TrainerConfig::default(), 3, 0);
        assert_eq!(config.member_run_ids(), vec![0, 1, 2]);

        config.ensemble_size = 1;
        config.run_id = 7;
        assert_eq!(config.member_run_ids(), vec![7]);
    }

    #[test]
    fn test_run_identity_display() {
        let ident = RunIdentity::new(2, 5);
        assert_eq!(ident.to_string(), "2_5");
    }
}
