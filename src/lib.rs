//! Ensemble training and evaluation for materials-property models.
//!
//! This crate owns the training workflow around externally supplied model
//! architectures and featurized datasets: target normalization, robust
//! (uncertainty-predicting) loss functions, optimizers and learning-rate
//! schedules, resumable checkpointing keyed by (fold, run), cooperative
//! interruption, and ensemble orchestration with epistemic/aleatoric
//! uncertainty decomposition and propagated-error test metrics.
//!
//! # Example
//!
//! ```
//! use matprop_train::{
//!     train_ensemble, EnsembleConfig, InMemoryDataLoader, InterruptFlag, MlpModel,
//!     TrainerConfig,
//! };
//! use ndarray::{Array1, Array2};
//!
//! # fn main() -> Result<(), matprop_train::TrainError> {
//! let inputs = Array2::from_shape_fn((32, 2), |(i, j)| (i + j) as f64 / 32.0);
//! let targets = Array1::from_iter((0..32).map(|i| i as f64 / 16.0));
//! let train = InMemoryDataLoader::from_arrays(inputs.clone(), targets.clone(), 8)?;
//! let val = InMemoryDataLoader::from_arrays(inputs, targets, 8)?;
//!
//! let trainer = TrainerConfig {
//!     epochs: 2,
//!     checkpoint_dir: std::env::temp_dir().join("matprop-doc"),
//!     ..Default::default()
//! };
//! let config = EnsembleConfig::new(trainer, 2, 0);
//!
//! let summaries = train_ensemble(
//!     &config,
//!     |seed| MlpModel::new(2, 8, 2, seed),
//!     &train,
//!     Some(&val),
//!     &val,
//!     &InterruptFlag::new(),
//! )?;
//! assert_eq!(summaries.len(), 2);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod normalizer;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{load_record, load_weights, CheckpointManager, CheckpointRecord};
pub use config::{
    EnsembleConfig, InitStrategy, LossKind, OptimizerKind, RunIdentity, TaskType, TrainerConfig,
};
pub use data::{Batch, DataLoader, InMemoryDataLoader};
pub use ensemble::{
    decompose_uncertainty, evaluate_ensemble, train_ensemble, write_results_csv,
    ClassificationSummary, EnsembleEvaluation, RegressionSummary, SampleResult,
    UncertaintyDecomposition,
};
pub use error::{TrainError, TrainResult};
pub use evaluator::{run_epoch, run_inference, TaskMetrics, TestOutput};
pub use logging::{ConsoleLogger, CsvLogger, MetricLogger, MultiLogger};
pub use loss::{
    resolve_loss, CrossEntropyLoss, L1Loss, Loss, MseLoss, RobustCrossEntropyLoss, RobustL1Loss,
    RobustL2Loss,
};
pub use model::{MlpModel, PropertyModel};
pub use normalizer::Normalizer;
pub use optimizer::{resolve_optimizer, AdamOptimizer, Optimizer, SgdOptimizer};
pub use scheduler::{LrScheduler, MultiStepLrScheduler};
pub use trainer::{InterruptFlag, RunSummary, SingleRunTrainer};
