//! Evaluation metrics.
//!
//! Regression metrics operate in de-normalized target units. The standard
//! errors propagate sampling uncertainty: MAE's is the standard deviation of
//! the absolute residuals over sqrt(n), and RMSE's follows from the MSE
//! standard error through the square root by a first-order delta step.

use crate::{TrainError, TrainResult};
use ndarray::ArrayView2;

fn check_paired(predictions: &[f64], targets: &[f64]) -> TrainResult<()> {
    if predictions.len() != targets.len() {
        return Err(TrainError::Metrics(format!(
            "{} predictions vs {} targets",
            predictions.len(),
            targets.len()
        )));
    }
    if predictions.is_empty() {
        return Err(TrainError::Metrics("no samples".into()));
    }
    Ok(())
}

/// Mean absolute error.
pub fn mae(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    check_paired(predictions, targets)?;
    let n = predictions.len() as f64;
    Ok(predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / n)
}

/// Mean squared error.
pub fn mse(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    check_paired(predictions, targets)?;
    let n = predictions.len() as f64;
    Ok(predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t).powi(2))
        .sum::<f64>()
        / n)
}

/// Root mean squared error.
pub fn rmse(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    Ok(mse(predictions, targets)?.sqrt())
}

/// Standard error of the mean of `values`.
fn standard_error(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    let values: Vec<f64> = values.collect();
    let n_f = n as f64;
    let mean = values.iter().sum::<f64>() / n_f;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n_f;
    (var / n_f).sqrt()
}

/// Standard error of the MAE.
pub fn mae_standard_error(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    check_paired(predictions, targets)?;
    let n = predictions.len();
    Ok(standard_error(
        predictions.iter().zip(targets).map(|(p, t)| (p - t).abs()),
        n,
    ))
}

/// Standard error of the MSE.
pub fn mse_standard_error(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    check_paired(predictions, targets)?;
    let n = predictions.len();
    Ok(standard_error(
        predictions.iter().zip(targets).map(|(p, t)| (p - t).powi(2)),
        n,
    ))
}

/// Standard error of the RMSE, propagated from the MSE standard error.
///
/// Returns 0 when the MSE is (numerically) zero, where the delta
/// approximation would divide by zero.
pub fn rmse_standard_error(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    let mse_value = mse(predictions, targets)?;
    if mse_value <= f64::EPSILON {
        return Ok(0.0);
    }
    let rmse_value = mse_value.sqrt();
    Ok(0.5 * rmse_value * mse_standard_error(predictions, targets)? / mse_value)
}

/// Coefficient of determination. `NaN` when the targets have zero variance,
/// where the score is undefined.
pub fn r2_score(predictions: &[f64], targets: &[f64]) -> TrainResult<f64> {
    check_paired(predictions, targets)?;
    let n = targets.len() as f64;
    let mean = targets.iter().sum::<f64>() / n;

    let ss_tot: f64 = targets.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = predictions
        .iter()
        .zip(targets)
        .map(|(p, t)| (t - p).powi(2))
        .sum();

    if ss_tot == 0.0 {
        return Ok(f64::NAN);
    }
    Ok(1.0 - ss_res / ss_tot)
}

/// Validate a float-encoded class index against the class count.
pub(crate) fn class_index(target: f64, n_classes: usize) -> Result<usize, String> {
    let class = target as usize;
    if target < 0.0 || target.fract() != 0.0 || class >= n_classes {
        return Err(format!(
            "target {} is not a class index below {}",
            target, n_classes
        ));
    }
    Ok(class)
}

/// Argmax over each logit row.
pub fn argmax_rows(logits: &ArrayView2<f64>) -> Vec<usize> {
    logits
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best, max), (j, &v)| {
                    if v > max {
                        (j, v)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect()
}

/// Classification accuracy from logits against class-index targets.
pub fn accuracy(logits: &ArrayView2<f64>, targets: &[f64]) -> TrainResult<f64> {
    if logits.nrows() != targets.len() {
        return Err(TrainError::Metrics(format!(
            "{} logit rows vs {} targets",
            logits.nrows(),
            targets.len()
        )));
    }
    if targets.is_empty() {
        return Err(TrainError::Metrics("no samples".into()));
    }

    let n_classes = logits.ncols();
    let predicted = argmax_rows(logits);
    let mut correct = 0usize;
    for (p, &t) in predicted.iter().zip(targets) {
        let class = class_index(t, n_classes).map_err(TrainError::Metrics)?;
        if *p == class {
            correct += 1;
        }
    }
    Ok(correct as f64 / targets.len() as f64)
}

/// Binary ROC AUC from positive-class scores, via the rank-sum identity.
/// Ties receive their average rank. Errors when either class is absent.
pub fn binary_roc_auc(scores: &[f64], labels: &[bool]) -> TrainResult<f64> {
    if scores.len() != labels.len() {
        return Err(TrainError::Metrics(format!(
            "{} scores vs {} labels",
            scores.len(),
            labels.len()
        )));
    }
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(TrainError::Metrics(
            "ROC AUC needs both classes present".into(),
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Average ranks over tied scores.
    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(l, _)| **l)
        .map(|(_, r)| r)
        .sum();
    let n_pos_f = n_pos as f64;
    let auc = (pos_rank_sum - n_pos_f * (n_pos_f + 1.0) / 2.0) / (n_pos_f * n_neg as f64);
    Ok(auc)
}

/// ROC AUC from class logits: binary AUC for two classes, macro-averaged
/// one-vs-rest for more.
pub fn roc_auc(logits: &ArrayView2<f64>, targets: &[f64]) -> TrainResult<f64> {
    let n_classes = logits.ncols();
    if n_classes < 2 {
        return Err(TrainError::Metrics("ROC AUC needs at least 2 classes".into()));
    }
    let probs = softmax_rows(logits);
    let classes = targets
        .iter()
        .map(|&t| class_index(t, n_classes).map_err(TrainError::Metrics))
        .collect::<TrainResult<Vec<usize>>>()?;

    if n_classes == 2 {
        let scores: Vec<f64> = probs.column(1).to_vec();
        let labels: Vec<bool> = classes.iter().map(|&c| c == 1).collect();
        return binary_roc_auc(&scores, &labels);
    }

    let mut total = 0.0;
    for class in 0..n_classes {
        let scores: Vec<f64> = probs.column(class).to_vec();
        let labels: Vec<bool> = classes.iter().map(|&c| c == class).collect();
        total += binary_roc_auc(&scores, &labels)?;
    }
    Ok(total / n_classes as f64)
}

/// Row-wise softmax over a logits matrix.
pub fn softmax_rows(logits: &ArrayView2<f64>) -> ndarray::Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}
