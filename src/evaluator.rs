//! Epoch evaluation.
//!
//! One routine runs a full pass over a loader in either training mode
//! (optimizer present, parameters updated) or evaluation mode (forward
//! only), accumulating task-appropriate metrics. A second routine collects
//! raw per-sample predictions for ensemble aggregation.

use crate::loss::Loss;
use crate::metrics;
use crate::model::PropertyModel;
use crate::optimizer::Optimizer;
use crate::{DataLoader, Normalizer, TaskType, TrainError, TrainResult, TrainerConfig};
use ndarray::{Array1, Array2, Axis};

/// Metrics accumulated over one epoch. Loss is reported on the scale the
/// criterion saw (normalized targets for regression); the remaining
/// regression metrics are in de-normalized target units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskMetrics {
    /// Regression epoch summary.
    Regression {
        /// Mean criterion value per sample.
        loss: f64,
        /// Mean absolute error in target units.
        mae: f64,
        /// Root mean squared error in target units.
        rmse: f64,
    },
    /// Classification epoch summary.
    Classification {
        /// Mean criterion value per sample.
        loss: f64,
        /// Fraction of correctly classified samples.
        accuracy: f64,
        /// ROC AUC; `NaN` when a class is absent from the split.
        auc: f64,
    },
}

impl TaskMetrics {
    /// Mean criterion value.
    pub fn loss(&self) -> f64 {
        match self {
            Self::Regression { loss, .. } | Self::Classification { loss, .. } => *loss,
        }
    }

    /// The watched checkpoint-selection score (lower is better): validation
    /// MAE for regression, validation loss for classification.
    pub fn score(&self) -> f64 {
        match self {
            Self::Regression { mae, .. } => *mae,
            Self::Classification { loss, .. } => *loss,
        }
    }
}

/// Run one epoch over `loader`.
///
/// With `Some(optimizer)` this is a training pass: gradients flow and
/// parameters update after every batch. With `None` it is a pure evaluation
/// pass. Regression targets are normalized before the criterion sees them
/// and predictions are mapped back to target units for the error metrics.
pub fn run_epoch<M: PropertyModel>(
    model: &mut M,
    loader: &dyn DataLoader,
    criterion: &dyn Loss,
    mut optimizer: Option<&mut dyn Optimizer>,
    normalizer: &Normalizer,
    config: &TrainerConfig,
) -> TrainResult<TaskMetrics> {
    let task = config.task;
    if loader.is_empty() {
        return Err(TrainError::Data("cannot run an epoch over an empty loader".into()));
    }
    model.set_training(optimizer.is_some());

    let mut loss_sum = 0.0;
    let mut sample_count = 0usize;
    let mut point_predictions: Vec<f64> = Vec::with_capacity(loader.num_samples());
    let mut raw_targets: Vec<f64> = Vec::with_capacity(loader.num_samples());
    let mut logit_rows: Vec<Array2<f64>> = Vec::new();

    for batch in loader.batches() {
        let targets = match task {
            TaskType::Regression => batch.targets.mapv(|t| normalizer.transform(t)),
            TaskType::Classification => batch.targets.clone(),
        };

        let outputs = model.forward(&batch.inputs.view())?;
        let batch_loss = criterion.compute(&outputs.view(), &targets.view())?;
        loss_sum += batch_loss * batch.len() as f64;
        sample_count += batch.len();

        if let Some(optimizer) = optimizer.as_deref_mut() {
            let grad_output = criterion.gradient(&outputs.view(), &targets.view())?;
            let gradients = model.backward(&batch.inputs.view(), &grad_output.view())?;
            optimizer.step(model.parameters_mut(), &gradients)?;
        }

        match task {
            TaskType::Regression => {
                point_predictions
                    .extend(outputs.column(0).iter().map(|&p| normalizer.inverse_transform(p)));
                raw_targets.extend(batch.targets.iter());
            }
            TaskType::Classification => {
                logit_rows.push(outputs);
                raw_targets.extend(batch.targets.iter());
            }
        }
    }

    let mean_loss = loss_sum / sample_count as f64;
    match task {
        TaskType::Regression => Ok(TaskMetrics::Regression {
            loss: mean_loss,
            mae: metrics::mae(&point_predictions, &raw_targets)?,
            rmse: metrics::rmse(&point_predictions, &raw_targets)?,
        }),
        TaskType::Classification => {
            let logits = concat_rows(&logit_rows)?;
            let n_classes = config.n_classes.min(logits.ncols());
            let class_logits = logits.slice_axis(Axis(1), (0..n_classes).into()).to_owned();

            let auc = match metrics::roc_auc(&class_logits.view(), &raw_targets) {
                Ok(auc) => auc,
                Err(e) => {
                    log::warn!("ROC AUC unavailable for this split ({}); reporting NaN", e);
                    f64::NAN
                }
            };
            Ok(TaskMetrics::Classification {
                loss: mean_loss,
                accuracy: metrics::accuracy(&class_logits.view(), &raw_targets)?,
                auc,
            })
        }
    }
}

/// Raw per-sample predictions of one model over one loader, in loader order.
#[derive(Debug, Clone)]
pub enum TestOutput {
    /// Regression predictions in de-normalized target units.
    Regression {
        /// Sample identifiers.
        ids: Vec<String>,
        /// Human-readable keys.
        keys: Vec<String>,
        /// Ground-truth targets.
        targets: Array1<f64>,
        /// Point predictions.
        predictions: Array1<f64>,
        /// Predicted aleatoric standard deviations (zeros for non-robust
        /// criteria).
        stds: Array1<f64>,
    },
    /// Classification logits.
    Classification {
        /// Sample identifiers.
        ids: Vec<String>,
        /// Human-readable keys.
        keys: Vec<String>,
        /// Ground-truth class indices.
        targets: Array1<f64>,
        /// Class logits, one row per sample.
        logits: Array2<f64>,
    },
}

/// Run pure inference over `loader`, collecting per-sample outputs for
/// ensemble aggregation. Robust regression heads have their log-std column
/// exponentiated and scaled back to target units.
pub fn run_inference<M: PropertyModel>(
    model: &mut M,
    loader: &dyn DataLoader,
    normalizer: &Normalizer,
    config: &TrainerConfig,
) -> TrainResult<TestOutput> {
    if loader.is_empty() {
        return Err(TrainError::Data("cannot run inference over an empty loader".into()));
    }
    model.set_training(false);

    let mut ids = Vec::with_capacity(loader.num_samples());
    let mut keys = Vec::with_capacity(loader.num_samples());
    let mut targets = Vec::with_capacity(loader.num_samples());

    match config.task {
        TaskType::Regression => {
            let mut predictions = Vec::with_capacity(loader.num_samples());
            let mut stds = Vec::with_capacity(loader.num_samples());

            for batch in loader.batches() {
                let outputs = model.forward(&batch.inputs.view())?;
                if outputs.ncols() == 0 {
                    return Err(TrainError::Model("regression head has no columns".into()));
                }
                predictions
                    .extend(outputs.column(0).iter().map(|&p| normalizer.inverse_transform(p)));
                if config.robust {
                    if outputs.ncols() < 2 {
                        return Err(TrainError::Model(
                            "robust regression requires a log-std output column".into(),
                        ));
                    }
                    stds.extend(
                        outputs
                            .column(1)
                            .iter()
                            .map(|&s| normalizer.denormalize_std(s.exp())),
                    );
                } else {
                    stds.extend(std::iter::repeat(0.0).take(batch.len()));
                }
                ids.extend(batch.ids);
                keys.extend(batch.keys);
                targets.extend(batch.targets.iter());
            }

            Ok(TestOutput::Regression {
                ids,
                keys,
                targets: Array1::from_vec(targets),
                predictions: Array1::from_vec(predictions),
                stds: Array1::from_vec(stds),
            })
        }
        TaskType::Classification => {
            let mut logit_rows = Vec::new();
            for batch in loader.batches() {
                let outputs = model.forward(&batch.inputs.view())?;
                logit_rows.push(outputs);
                ids.extend(batch.ids);
                keys.extend(batch.keys);
                targets.extend(batch.targets.iter());
            }

            let logits = concat_rows(&logit_rows)?;
            let n_classes = config.n_classes.min(logits.ncols());
            let class_logits = logits.slice_axis(Axis(1), (0..n_classes).into()).to_owned();

            Ok(TestOutput::Classification {
                ids,
                keys,
                targets: Array1::from_vec(targets),
                logits: class_logits,
            })
        }
    }
}

fn concat_rows(rows: &[Array2<f64>]) -> TrainResult<Array2<f64>> {
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| TrainError::Data(format!("batch outputs disagree on width: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::{resolve_loss, RobustL1Loss};
    use crate::model::MlpModel;
    use crate::optimizer::SgdOptimizer;
    use crate::{InMemoryDataLoader, LossKind};
    use ndarray::Array2;

    fn linear_loader(n: usize) -> InMemoryDataLoader {
        // y = 2x with a deterministic feature grid.
        let inputs = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64);
        let targets = Array1::from_iter((0..n).map(|i| 2.0 * i as f64 / n as f64));
        InMemoryDataLoader::from_arrays(inputs, targets, 8).unwrap()
    }

    fn regression_config(robust: bool) -> TrainerConfig {
        TrainerConfig {
            robust,
            ..Default::default()
        }
    }

    fn classification_config() -> TrainerConfig {
        TrainerConfig {
            task: TaskType::Classification,
            loss: LossKind::CrossEntropy,
            robust: false,
            n_classes: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_eval_pass_does_not_change_parameters() {
        let mut model = MlpModel::new(1, 4, 2, 0);
        let loader = linear_loader(16);
        let normalizer = Normalizer::fit(&loader.targets()).unwrap();
        let before = model.parameters().clone();

        run_epoch(
            &mut model,
            &loader,
            &RobustL1Loss,
            None,
            &normalizer,
            &regression_config(true),
        )
        .unwrap();

        assert_eq!(&before, model.parameters());
    }

    #[test]
    fn test_training_pass_reduces_loss() {
        let mut model = MlpModel::new(1, 8, 2, 3);
        let loader = linear_loader(32);
        let normalizer = Normalizer::fit(&loader.targets()).unwrap();
        let criterion = RobustL1Loss;
        let mut optimizer = SgdOptimizer::new(0.05, 0.9, 0.0);

        let config = regression_config(true);
        let initial = run_epoch(&mut model, &loader, &criterion, None, &normalizer, &config)
            .unwrap();

        for _ in 0..50 {
            run_epoch(
                &mut model,
                &loader,
                &criterion,
                Some(&mut optimizer),
                &normalizer,
                &config,
            )
            .unwrap();
        }

        let trained = run_epoch(&mut model, &loader, &criterion, None, &normalizer, &config)
            .unwrap();

        assert!(trained.loss() < initial.loss());
        assert!(trained.score() < initial.score());
    }

    #[test]
    fn test_regression_metrics_are_in_target_units() {
        // A model that always predicts the normalized mean (0) has MAE equal
        // to the mean absolute deviation of the raw targets.
        let mut model = MlpModel::new(1, 4, 1, 0);
        for param in model.parameters_mut().values_mut() {
            param.fill(0.0);
        }
        let loader = linear_loader(16);
        let normalizer = Normalizer::fit(&loader.targets()).unwrap();

        let metrics = run_epoch(
            &mut model,
            &loader,
            resolve_loss(LossKind::L1, false, 2).as_ref(),
            None,
            &normalizer,
            &regression_config(false),
        )
        .unwrap();

        let targets = loader.targets();
        let mean = normalizer.mean();
        let expected: f64 =
            targets.iter().map(|t| (t - mean).abs()).sum::<f64>() / targets.len() as f64;
        match metrics {
            TaskMetrics::Regression { mae, .. } => assert!((mae - expected).abs() < 1e-9),
            _ => panic!("expected regression metrics"),
        }
    }

    #[test]
    fn test_classification_epoch_reports_accuracy() {
        let inputs = Array2::from_shape_fn((20, 2), |(i, j)| {
            if (i < 10) == (j == 0) {
                1.0
            } else {
                0.0
            }
        });
        let targets = Array1::from_iter((0..20).map(|i| if i < 10 { 0.0 } else { 1.0 }));
        let loader = InMemoryDataLoader::from_arrays(inputs, targets, 5).unwrap();

        let mut model = MlpModel::new(2, 8, 2, 1);
        let metrics = run_epoch(
            &mut model,
            &loader,
            resolve_loss(LossKind::CrossEntropy, false, 2).as_ref(),
            None,
            &Normalizer::identity(),
            &classification_config(),
        )
        .unwrap();

        match metrics {
            TaskMetrics::Classification { accuracy, .. } => {
                assert!((0.0..=1.0).contains(&accuracy))
            }
            _ => panic!("expected classification metrics"),
        }
    }

    #[test]
    fn test_inference_preserves_loader_order() {
        let mut model = MlpModel::new(1, 4, 2, 0);
        let loader = linear_loader(10);
        let normalizer = Normalizer::fit(&loader.targets()).unwrap();
        let config = TrainerConfig::default();

        let output = run_inference(&mut model, &loader, &normalizer, &config).unwrap();
        match output {
            TestOutput::Regression { ids, targets, stds, .. } => {
                assert_eq!(ids, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
                assert_eq!(targets.len(), 10);
                assert!(stds.iter().all(|&s| s > 0.0));
            }
            _ => panic!("expected regression output"),
        }
    }

    #[test]
    fn test_non_robust_inference_reports_zero_stds() {
        let mut model = MlpModel::new(1, 4, 1, 0);
        let loader = linear_loader(6);
        let normalizer = Normalizer::fit(&loader.targets()).unwrap();
        let config = TrainerConfig {
            robust: false,
            ..Default::default()
        };

        match run_inference(&mut model, &loader, &normalizer, &config).unwrap() {
            TestOutput::Regression { stds, .. } => assert!(stds.iter().all(|&s| s == 0.0)),
            _ => panic!("expected regression output"),
        }
    }

    #[test]
    fn test_empty_loader_rejected() {
        let loader =
            InMemoryDataLoader::from_arrays(Array2::zeros((0, 1)), Array1::zeros(0), 4).unwrap();
        let mut model = MlpModel::new(1, 4, 2, 0);
        assert!(run_epoch(
            &mut model,
            &loader,
            &RobustL1Loss,
            None,
            &Normalizer::identity(),
            &regression_config(true),
        )
        .is_err());
    }
}
