//! Ensemble orchestration and aggregation.
//!
//! Members are trained sequentially, each from its own seed, sharing one
//! checkpoint directory keyed by (fold, run). Evaluation reloads every
//! member's "best" checkpoint, collects per-sample predictions in loader
//! order and decomposes the predictive uncertainty into an epistemic part
//! (spread across members) and an aleatoric part (noise each member
//! predicts).

use crate::checkpoint::CheckpointManager;
use crate::evaluator::{run_inference, TestOutput};
use crate::metrics;
use crate::model::PropertyModel;
use crate::trainer::{InterruptFlag, RunSummary, SingleRunTrainer};
use crate::{
    DataLoader, EnsembleConfig, RunIdentity, TaskType, TrainError, TrainResult,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Per-sample uncertainty decomposition over an ensemble.
#[derive(Debug, Clone)]
pub struct UncertaintyDecomposition {
    /// Ensemble-mean prediction.
    pub mean: Array1<f64>,
    /// Spread of member point predictions (population standard deviation).
    pub epistemic: Array1<f64>,
    /// Root mean square of member-predicted standard deviations.
    pub aleatoric: Array1<f64>,
    /// Combined predictive standard deviation,
    /// `sqrt(epistemic^2 + aleatoric^2)`.
    pub total: Array1<f64>,
}

/// Decompose ensemble predictions into mean and uncertainty components.
///
/// `member_predictions` and `member_stds` hold one row per member over the
/// same sample order. The epistemic component uses the population variance
/// over members; single-member ensembles therefore report zero epistemic
/// uncertainty rather than an undefined one.
pub fn decompose_uncertainty(
    member_predictions: &ArrayView2<f64>,
    member_stds: &ArrayView2<f64>,
) -> TrainResult<UncertaintyDecomposition> {
    if member_predictions.raw_dim() != member_stds.raw_dim() {
        return Err(TrainError::Metrics(format!(
            "prediction matrix {:?} vs std matrix {:?}",
            member_predictions.shape(),
            member_stds.shape()
        )));
    }
    let n_members = member_predictions.nrows();
    if n_members == 0 {
        return Err(TrainError::Metrics("no ensemble members".into()));
    }

    let mean = member_predictions.mean_axis(Axis(0)).ok_or_else(|| {
        TrainError::Metrics("empty prediction matrix".into())
    })?;

    let n = n_members as f64;
    let epistemic_var = member_predictions
        .axis_iter(Axis(1))
        .zip(mean.iter())
        .map(|(column, &m)| column.iter().map(|&p| (p - m).powi(2)).sum::<f64>() / n)
        .collect::<Array1<f64>>();
    let aleatoric_var = member_stds
        .axis_iter(Axis(1))
        .map(|column| column.iter().map(|&s| s * s).sum::<f64>() / n)
        .collect::<Array1<f64>>();

    let epistemic = epistemic_var.mapv(f64::sqrt);
    let aleatoric = aleatoric_var.mapv(f64::sqrt);
    let total = (&epistemic_var + &aleatoric_var).mapv(f64::sqrt);

    Ok(UncertaintyDecomposition {
        mean,
        epistemic,
        aleatoric,
        total,
    })
}

/// One aggregated test-set row.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// Sample identifier.
    pub id: String,
    /// Human-readable key (composition string).
    pub key: String,
    /// Ground-truth target.
    pub target: f64,
    /// Ensemble-mean prediction.
    pub mean: f64,
    /// Combined predictive standard deviation.
    pub std: f64,
    /// Epistemic component.
    pub epistemic: f64,
    /// Aleatoric component.
    pub aleatoric: f64,
}

/// Aggregate regression metrics with propagated sampling errors.
#[derive(Debug, Clone, Copy)]
pub struct RegressionSummary {
    /// Coefficient of determination (`NaN` on zero target variance).
    pub r2: f64,
    /// Mean absolute error.
    pub mae: f64,
    /// Standard error of the MAE.
    pub mae_stderr: f64,
    /// Mean squared error.
    pub mse: f64,
    /// Standard error of the MSE.
    pub mse_stderr: f64,
    /// Root mean squared error.
    pub rmse: f64,
    /// Standard error of the RMSE.
    pub rmse_stderr: f64,
}

/// Aggregate classification metrics from averaged member logits.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationSummary {
    /// Accuracy of the logit-averaged ensemble.
    pub accuracy: f64,
    /// ROC AUC of the logit-averaged ensemble; `NaN` when a class is absent.
    pub auc: f64,
}

/// Result of evaluating an ensemble on a test set.
#[derive(Debug, Clone)]
pub enum EnsembleEvaluation {
    /// Regression: aggregate metrics plus per-sample rows.
    Regression {
        /// Aggregate metrics of the ensemble-mean prediction.
        summary: RegressionSummary,
        /// Per-sample rows in loader order.
        samples: Vec<SampleResult>,
    },
    /// Classification: aggregate metrics of the logit-averaged ensemble.
    Classification {
        /// Aggregate metrics.
        summary: ClassificationSummary,
    },
}

/// Train every member of the ensemble sequentially.
///
/// `build_model` receives the member's seed and must return a
/// freshly-initialized model; distinct seeds are what make members diverge.
/// When `val_loader` is `None` the test loader doubles as the validation set
/// only if the config explicitly opted in; checkpoint selection against the
/// test set biases the reported metrics, so the substitution is loud.
pub fn train_ensemble<M, F>(
    config: &EnsembleConfig,
    mut build_model: F,
    train_loader: &dyn DataLoader,
    val_loader: Option<&dyn DataLoader>,
    test_loader: &dyn DataLoader,
    interrupt: &InterruptFlag,
) -> TrainResult<Vec<RunSummary>>
where
    M: PropertyModel,
    F: FnMut(u64) -> M,
{
    config.validate()?;

    let val_loader: &dyn DataLoader = match val_loader {
        Some(loader) => loader,
        None if config.use_test_as_validation => {
            log::warn!(
                "no validation set: checkpoints will be selected on the test set, \
                 biasing the reported best metrics"
            );
            test_loader
        }
        None => {
            return Err(TrainError::Config(
                "no validation loader; set use_test_as_validation to reuse the test set".into(),
            ))
        }
    };

    let mut summaries = Vec::with_capacity(config.ensemble_size);
    for run_id in config.member_run_ids() {
        if interrupt.is_interrupted() {
            log::warn!("ensemble interrupted before member {}", run_id);
            break;
        }

        let seed = config.member_seed(run_id);
        let ident = RunIdentity::new(config.fold_id, run_id);
        let mut model = build_model(seed);
        let mut trainer = SingleRunTrainer::new(config.trainer.clone(), ident)?
            .with_interrupt(interrupt.clone());

        log::info!("training ensemble member {} (seed {})", ident, seed);
        let summary = trainer.train(&mut model, &config.init, seed, train_loader, val_loader)?;
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Evaluate the ensemble on a test set from each member's "best" checkpoint.
///
/// Every member must iterate the test loader in the identical sample order;
/// mismatched id sequences are a hard error rather than a silent
/// misalignment.
pub fn evaluate_ensemble<M, F>(
    config: &EnsembleConfig,
    mut build_model: F,
    test_loader: &dyn DataLoader,
) -> TrainResult<EnsembleEvaluation>
where
    M: PropertyModel,
    F: FnMut(u64) -> M,
{
    config.validate()?;

    let mut outputs = Vec::with_capacity(config.ensemble_size);
    for run_id in config.member_run_ids() {
        let ident = RunIdentity::new(config.fold_id, run_id);
        let manager = CheckpointManager::new(
            &config.trainer.checkpoint_dir,
            ident,
            config.trainer.gzip_checkpoints,
        );
        let record = manager.load_best()?;

        let mut model = build_model(config.member_seed(run_id));
        model.load_state_dict(record.model_state)?;
        outputs.push(run_inference(
            &mut model,
            test_loader,
            &record.normalizer,
            &config.trainer,
        )?);
    }

    match config.trainer.task {
        TaskType::Regression => aggregate_regression(outputs),
        TaskType::Classification => aggregate_classification(outputs),
    }
}

fn aggregate_regression(outputs: Vec<TestOutput>) -> TrainResult<EnsembleEvaluation> {
    let mut ids: Option<Vec<String>> = None;
    let mut keys: Vec<String> = Vec::new();
    let mut targets: Option<Array1<f64>> = None;
    let mut prediction_rows: Vec<Array1<f64>> = Vec::new();
    let mut std_rows: Vec<Array1<f64>> = Vec::new();

    for output in outputs {
        match output {
            TestOutput::Regression {
                ids: member_ids,
                keys: member_keys,
                targets: member_targets,
                predictions,
                stds,
            } => {
                match &ids {
                    None => {
                        ids = Some(member_ids);
                        keys = member_keys;
                        targets = Some(member_targets);
                    }
                    Some(first) => {
                        if *first != member_ids {
                            return Err(TrainError::Data(
                                "ensemble members disagree on test sample order".into(),
                            ));
                        }
                    }
                }
                prediction_rows.push(predictions);
                std_rows.push(stds);
            }
            TestOutput::Classification { .. } => {
                return Err(TrainError::Data(
                    "classification output in a regression ensemble".into(),
                ))
            }
        }
    }

    let ids = ids.ok_or_else(|| TrainError::Metrics("no ensemble members".into()))?;
    let targets = targets.ok_or_else(|| TrainError::Metrics("no ensemble members".into()))?;
    let predictions = stack_rows(&prediction_rows)?;
    let stds = stack_rows(&std_rows)?;
    let decomposition = decompose_uncertainty(&predictions.view(), &stds.view())?;

    let mean_vec = decomposition.mean.to_vec();
    let target_vec = targets.to_vec();
    let summary = RegressionSummary {
        r2: metrics::r2_score(&mean_vec, &target_vec)?,
        mae: metrics::mae(&mean_vec, &target_vec)?,
        mae_stderr: metrics::mae_standard_error(&mean_vec, &target_vec)?,
        mse: metrics::mse(&mean_vec, &target_vec)?,
        mse_stderr: metrics::mse_standard_error(&mean_vec, &target_vec)?,
        rmse: metrics::rmse(&mean_vec, &target_vec)?,
        rmse_stderr: metrics::rmse_standard_error(&mean_vec, &target_vec)?,
    };

    let samples = ids
        .into_iter()
        .zip(keys)
        .enumerate()
        .map(|(i, (id, key))| SampleResult {
            id,
            key,
            target: targets[i],
            mean: decomposition.mean[i],
            std: decomposition.total[i],
            epistemic: decomposition.epistemic[i],
            aleatoric: decomposition.aleatoric[i],
        })
        .collect();

    Ok(EnsembleEvaluation::Regression { summary, samples })
}

fn aggregate_classification(outputs: Vec<TestOutput>) -> TrainResult<EnsembleEvaluation> {
    let mut ids: Option<Vec<String>> = None;
    let mut targets: Option<Array1<f64>> = None;
    let mut summed_logits: Option<Array2<f64>> = None;
    let mut n_members = 0usize;

    for output in outputs {
        match output {
            TestOutput::Classification {
                ids: member_ids,
                targets: member_targets,
                logits,
                ..
            } => {
                match &ids {
                    None => {
                        ids = Some(member_ids);
                        targets = Some(member_targets);
                    }
                    Some(first) => {
                        if *first != member_ids {
                            return Err(TrainError::Data(
                                "ensemble members disagree on test sample order".into(),
                            ));
                        }
                    }
                }
                summed_logits = Some(match summed_logits {
                    None => logits,
                    Some(sum) => sum + logits,
                });
                n_members += 1;
            }
            TestOutput::Regression { .. } => {
                return Err(TrainError::Data(
                    "regression output in a classification ensemble".into(),
                ))
            }
        }
    }

    let targets = targets.ok_or_else(|| TrainError::Metrics("no ensemble members".into()))?;
    let summed = summed_logits.ok_or_else(|| TrainError::Metrics("no ensemble members".into()))?;
    // Soft vote: average member logits, never argmax-then-vote.
    let mean_logits = summed / n_members as f64;
    let target_vec = targets.to_vec();

    let auc = match metrics::roc_auc(&mean_logits.view(), &target_vec) {
        Ok(auc) => auc,
        Err(e) => {
            log::warn!("ROC AUC unavailable for this split ({}); reporting NaN", e);
            f64::NAN
        }
    };
    let summary = ClassificationSummary {
        accuracy: metrics::accuracy(&mean_logits.view(), &target_vec)?,
        auc,
    };
    Ok(EnsembleEvaluation::Classification { summary })
}

fn stack_rows(rows: &[Array1<f64>]) -> TrainResult<Array2<f64>> {
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map_err(|e| TrainError::Data(format!("members disagree on sample count: {}", e)))
}

/// Write aggregated per-sample results as CSV, one row per test sample.
pub fn write_results_csv(path: &Path, samples: &[SampleResult]) -> TrainResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            TrainError::Other(format!("create dir {}: {}", parent.display(), e))
        })?;
    }
    let file = File::create(path)
        .map_err(|e| TrainError::Other(format!("create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "id,composition,target,mean,std,epistemic,aleatoric")
        .map_err(|e| TrainError::Other(format!("write {}: {}", path.display(), e)))?;
    for sample in samples {
        writeln!(
            writer,
            "{},{},{},{},{},{},{}",
            sample.id,
            sample.key,
            sample.target,
            sample.mean,
            sample.std,
            sample.epistemic,
            sample.aleatoric
        )
        .map_err(|e| TrainError::Other(format!("write {}: {}", path.display(), e)))?;
    }
    writer
        .flush()
        .map_err(|e| TrainError::Other(format!("flush {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_decomposition_single_member_has_zero_epistemic() {
        let preds = arr2(&[[1.0, 2.0, 3.0]]);
        let stds = arr2(&[[0.5, 0.5, 0.5]]);
        let d = decompose_uncertainty(&preds.view(), &stds.view()).unwrap();

        assert_eq!(d.mean.to_vec(), vec![1.0, 2.0, 3.0]);
        assert!(d.epistemic.iter().all(|&e| e == 0.0));
        assert!(d.aleatoric.iter().all(|&a| (a - 0.5).abs() < 1e-12));
        assert!(d.total.iter().all(|&t| (t - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_decomposition_combines_components_in_quadrature() {
        // Two members straddling the mean by 1: epistemic std = 1.
        let preds = arr2(&[[1.0], [3.0]]);
        // Both members predict aleatoric std 2.
        let stds = arr2(&[[2.0], [2.0]]);
        let d = decompose_uncertainty(&preds.view(), &stds.view()).unwrap();

        assert!((d.mean[0] - 2.0).abs() < 1e-12);
        assert!((d.epistemic[0] - 1.0).abs() < 1e-12);
        assert!((d.aleatoric[0] - 2.0).abs() < 1e-12);
        assert!((d.total[0] - 5.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_decomposition_invariant_to_member_order() {
        let preds = arr2(&[[1.0, 4.0], [2.0, 5.0], [6.0, 3.0]]);
        let stds = arr2(&[[0.1, 0.4], [0.2, 0.5], [0.3, 0.6]]);
        // Same members, rows permuted.
        let permuted_preds = arr2(&[[6.0, 3.0], [1.0, 4.0], [2.0, 5.0]]);
        let permuted_stds = arr2(&[[0.3, 0.6], [0.1, 0.4], [0.2, 0.5]]);

        let a = decompose_uncertainty(&preds.view(), &stds.view()).unwrap();
        let b = decompose_uncertainty(&permuted_preds.view(), &permuted_stds.view()).unwrap();

        for i in 0..2 {
            assert!((a.mean[i] - b.mean[i]).abs() < 1e-12);
            assert!((a.epistemic[i] - b.epistemic[i]).abs() < 1e-12);
            assert!((a.aleatoric[i] - b.aleatoric[i]).abs() < 1e-12);
            assert!((a.total[i] - b.total[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_decomposition_rejects_mismatched_shapes() {
        let preds = arr2(&[[1.0, 2.0]]);
        let stds = arr2(&[[1.0]]);
        assert!(decompose_uncertainty(&preds.view(), &stds.view()).is_err());
    }

    #[test]
    fn test_aleatoric_is_rms_of_member_stds() {
        let preds = arr2(&[[0.0], [0.0]]);
        let stds = arr2(&[[3.0], [4.0]]);
        let d = decompose_uncertainty(&preds.view(), &stds.view()).unwrap();
        assert!((d.aleatoric[0] - (12.5_f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_results_csv_layout() {
        let samples = vec![SampleResult {
            id: "mp-1".to_string(),
            key: "Fe2O3".to_string(),
            target: 1.5,
            mean: 1.4,
            std: 0.2,
            epistemic: 0.1,
            aleatoric: 0.17,
        }];

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("matprop-results-{}.csv", nanos));
        write_results_csv(&path, &samples).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "id,composition,target,mean,std,epistemic,aleatoric");
        assert!(lines[1].starts_with("mp-1,Fe2O3,1.5,1.4,"));

        std::fs::remove_file(&path).unwrap();
    }
}
