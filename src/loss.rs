//! Loss functions.
//!
//! Robust variants are negative log-likelihoods under a per-sample predicted
//! uncertainty: the model emits a point estimate and a log-std (regression)
//! or per-class log-variances (classification), and the loss attenuates the
//! error term by the predicted noise. Plain variants act on the point
//! estimate alone.

use crate::{LossKind, TrainError, TrainResult};
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::fmt::Debug;

/// Trait for loss functions.
///
/// `predictions` is the raw model output (layout depends on the criterion),
/// `targets` holds one scalar per sample: a regression value or a class
/// index.
pub trait Loss: Debug {
    /// Compute the mean loss over a batch.
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64>;

    /// Gradient of the mean loss w.r.t. every prediction column.
    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>>;

    /// Name of the loss function.
    fn name(&self) -> &'static str;
}

/// Resolve the concrete criterion once at configuration time.
pub fn resolve_loss(kind: LossKind, robust: bool, n_classes: usize) -> Box<dyn Loss> {
    match (kind, robust) {
        (LossKind::L1, false) => Box::new(L1Loss),
        (LossKind::L1, true) => Box::new(RobustL1Loss),
        (LossKind::L2, false) => Box::new(MseLoss),
        (LossKind::L2, true) => Box::new(RobustL2Loss),
        (LossKind::CrossEntropy, false) => Box::new(CrossEntropyLoss { n_classes }),
        (LossKind::CrossEntropy, true) => Box::new(RobustCrossEntropyLoss { n_classes }),
    }
}

fn check_columns(predictions: &ArrayView2<f64>, expected: usize, name: &str) -> TrainResult<()> {
    if predictions.ncols() != expected {
        return Err(TrainError::Loss(format!(
            "{} expects {} prediction columns, got {}",
            name,
            expected,
            predictions.ncols()
        )));
    }
    Ok(())
}

fn check_batch(
    predictions: &ArrayView2<f64>,
    targets: &ArrayView1<f64>,
    name: &str,
) -> TrainResult<()> {
    if predictions.nrows() != targets.len() {
        return Err(TrainError::Loss(format!(
            "{}: {} prediction rows vs {} targets",
            name,
            predictions.nrows(),
            targets.len()
        )));
    }
    if predictions.nrows() == 0 {
        return Err(TrainError::Loss(format!("{}: empty batch", name)));
    }
    Ok(())
}

/// Mean absolute error on a single point-estimate column.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Loss;

impl Loss for L1Loss {
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 1, self.name())?;

        let n = targets.len() as f64;
        let total: f64 = targets
            .iter()
            .enumerate()
            .map(|(i, &y)| (predictions[[i, 0]] - y).abs())
            .sum();
        Ok(total / n)
    }

    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 1, self.name())?;

        let n = targets.len() as f64;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (i, &y) in targets.iter().enumerate() {
            grad[[i, 0]] = (predictions[[i, 0]] - y).signum() / n;
        }
        Ok(grad)
    }

    fn name(&self) -> &'static str {
        "L1"
    }
}

/// Mean squared error on a single point-estimate column.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Loss for MseLoss {
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 1, self.name())?;

        let n = targets.len() as f64;
        let total: f64 = targets
            .iter()
            .enumerate()
            .map(|(i, &y)| (predictions[[i, 0]] - y).powi(2))
            .sum();
        Ok(total / n)
    }

    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 1, self.name())?;

        let n = targets.len() as f64;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (i, &y) in targets.iter().enumerate() {
            grad[[i, 0]] = 2.0 * (predictions[[i, 0]] - y) / n;
        }
        Ok(grad)
    }

    fn name(&self) -> &'static str {
        "L2"
    }
}

/// Laplace negative log-likelihood with a predicted scale.
///
/// Prediction columns: `[mean, log_std]`. Per sample:
/// `sqrt(2) * |y - mu| * exp(-s) + s` where `s = log_std`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RobustL1Loss;

impl Loss for RobustL1Loss {
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 2, self.name())?;

        let n = targets.len() as f64;
        let total: f64 = targets
            .iter()
            .enumerate()
            .map(|(i, &y)| {
                let mu = predictions[[i, 0]];
                let s = predictions[[i, 1]];
                std::f64::consts::SQRT_2 * (y - mu).abs() * (-s).exp() + s
            })
            .sum();
        Ok(total / n)
    }

    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 2, self.name())?;

        let n = targets.len() as f64;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (i, &y) in targets.iter().enumerate() {
            let mu = predictions[[i, 0]];
            let s = predictions[[i, 1]];
            let scale = std::f64::consts::SQRT_2 * (-s).exp();
            grad[[i, 0]] = scale * (mu - y).signum() / n;
            grad[[i, 1]] = (1.0 - scale * (y - mu).abs()) / n;
        }
        Ok(grad)
    }

    fn name(&self) -> &'static str {
        "RobustL1"
    }
}

/// Gaussian negative log-likelihood with a predicted scale.
///
/// Prediction columns: `[mean, log_std]`. Per sample:
/// `0.5 * (y - mu)^2 * exp(-2s) + s`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RobustL2Loss;

impl Loss for RobustL2Loss {
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 2, self.name())?;

        let n = targets.len() as f64;
        let total: f64 = targets
            .iter()
            .enumerate()
            .map(|(i, &y)| {
                let mu = predictions[[i, 0]];
                let s = predictions[[i, 1]];
                0.5 * (y - mu).powi(2) * (-2.0 * s).exp() + s
            })
            .sum();
        Ok(total / n)
    }

    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 2, self.name())?;

        let n = targets.len() as f64;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (i, &y) in targets.iter().enumerate() {
            let mu = predictions[[i, 0]];
            let s = predictions[[i, 1]];
            let attenuation = (-2.0 * s).exp();
            grad[[i, 0]] = (mu - y) * attenuation / n;
            grad[[i, 1]] = (1.0 - (y - mu).powi(2) * attenuation) / n;
        }
        Ok(grad)
    }

    fn name(&self) -> &'static str {
        "RobustL2"
    }
}

/// Stable row softmax.
pub(crate) fn softmax_row(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn class_index(target: f64, n_classes: usize, name: &str) -> TrainResult<usize> {
    crate::metrics::class_index(target, n_classes)
        .map_err(|msg| TrainError::Loss(format!("{}: {}", name, msg)))
}

/// Softmax cross-entropy on class logits; targets are class indices.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyLoss {
    /// Number of classes (= number of logit columns).
    pub n_classes: usize,
}

impl Loss for CrossEntropyLoss {
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, self.n_classes, self.name())?;

        let n = targets.len() as f64;
        let mut total = 0.0;
        for (i, &t) in targets.iter().enumerate() {
            let class = class_index(t, self.n_classes, self.name())?;
            let row: Vec<f64> = predictions.row(i).to_vec();
            let probs = softmax_row(&row);
            total -= probs[class].max(1e-12).ln();
        }
        Ok(total / n)
    }

    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, self.n_classes, self.name())?;

        let n = targets.len() as f64;
        let mut grad = Array2::zeros(predictions.raw_dim());
        for (i, &t) in targets.iter().enumerate() {
            let class = class_index(t, self.n_classes, self.name())?;
            let row: Vec<f64> = predictions.row(i).to_vec();
            let probs = softmax_row(&row);
            for j in 0..self.n_classes {
                let onehot = if j == class { 1.0 } else { 0.0 };
                grad[[i, j]] = (probs[j] - onehot) / n;
            }
        }
        Ok(grad)
    }

    fn name(&self) -> &'static str {
        "CrossEntropy"
    }
}

/// Uncertainty-attenuated cross-entropy.
///
/// Prediction columns: `n_classes` logits followed by `n_classes`
/// log-variance columns. Per sample the cross-entropy term is scaled by
/// `exp(-s_bar)` and regularized with `0.5 * s_bar`, `s_bar` being the mean
/// predicted log-variance. This is the deterministic loss-attenuation form
/// of the sampled-softmax robust criterion.
#[derive(Debug, Clone, Copy)]
pub struct RobustCrossEntropyLoss {
    /// Number of classes; prediction width is twice this.
    pub n_classes: usize,
}

impl RobustCrossEntropyLoss {
    fn mean_log_var(&self, predictions: &ArrayView2<f64>, row: usize) -> f64 {
        let c = self.n_classes;
        (0..c).map(|j| predictions[[row, c + j]]).sum::<f64>() / c as f64
    }
}

impl Loss for RobustCrossEntropyLoss {
    fn compute(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<f64> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 2 * self.n_classes, self.name())?;

        let n = targets.len() as f64;
        let mut total = 0.0;
        for (i, &t) in targets.iter().enumerate() {
            let class = class_index(t, self.n_classes, self.name())?;
            let logits: Vec<f64> = (0..self.n_classes).map(|j| predictions[[i, j]]).collect();
            let probs = softmax_row(&logits);
            let ce = -probs[class].max(1e-12).ln();
            let s_bar = self.mean_log_var(predictions, i);
            total += (-s_bar).exp() * ce + 0.5 * s_bar;
        }
        Ok(total / n)
    }

    fn gradient(
        &self,
        predictions: &ArrayView2<f64>,
        targets: &ArrayView1<f64>,
    ) -> TrainResult<Array2<f64>> {
        check_batch(predictions, targets, self.name())?;
        check_columns(predictions, 2 * self.n_classes, self.name())?;

        let c = self.n_classes;
        let n = targets.len() as f64;
        let mut grad = Array2::zeros(predictions.raw_dim());

        for (i, &t) in targets.iter().enumerate() {
            let class = class_index(t, c, self.name())?;
            let logits: Vec<f64> = (0..c).map(|j| predictions[[i, j]]).collect();
            let probs = softmax_row(&logits);
            let ce = -probs[class].max(1e-12).ln();
            let s_bar = self.mean_log_var(predictions, i);
            let attenuation = (-s_bar).exp();

            for j in 0..c {
                let onehot = if j == class { 1.0 } else { 0.0 };
                grad[[i, j]] = attenuation * (probs[j] - onehot) / n;
                // d s_bar / d s_j = 1/c
                grad[[i, c + j]] = (0.5 - attenuation * ce) / (c as f64 * n);
            }
        }
        Ok(grad)
    }

    fn name(&self) -> &'static str {
        "RobustCrossEntropy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_l1_loss_and_gradient() {
        let preds = arr2(&[[1.0], [3.0]]);
        let targets = arr1(&[2.0, 2.0]);
        let loss = L1Loss;

        let value = loss.compute(&preds.view(), &targets.view()).unwrap();
        assert!((value - 1.0).abs() < 1e-12);

        let grad = loss.gradient(&preds.view(), &targets.view()).unwrap();
        assert!((grad[[0, 0]] + 0.5).abs() < 1e-12);
        assert!((grad[[1, 0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mse_loss() {
        let preds = arr2(&[[0.0], [4.0]]);
        let targets = arr1(&[1.0, 1.0]);
        let value = MseLoss.compute(&preds.view(), &targets.view()).unwrap();
        assert!((value - 5.0).abs() < 1e-12); // (1 + 9) / 2
    }

    #[test]
    fn test_robust_l2_at_zero_log_std_matches_half_mse() {
        let preds = arr2(&[[0.0, 0.0], [4.0, 0.0]]);
        let targets = arr1(&[1.0, 1.0]);
        let value = RobustL2Loss.compute(&preds.view(), &targets.view()).unwrap();
        assert!((value - 2.5).abs() < 1e-12); // 0.5 * mse
    }

    #[test]
    fn test_robust_l1_prefers_high_uncertainty_on_large_errors() {
        // For a fixed large residual, claiming more noise must lower the loss.
        let targets = arr1(&[10.0]);
        let confident = arr2(&[[0.0, 0.0]]);
        let uncertain = arr2(&[[0.0, 2.0]]);

        let l_confident = RobustL1Loss.compute(&confident.view(), &targets.view()).unwrap();
        let l_uncertain = RobustL1Loss.compute(&uncertain.view(), &targets.view()).unwrap();
        assert!(l_uncertain < l_confident);
    }

    #[test]
    fn test_robust_gradients_match_finite_differences() {
        let losses: Vec<Box<dyn Loss>> = vec![Box::new(RobustL1Loss), Box::new(RobustL2Loss)];
        let targets = arr1(&[1.5, -0.5]);
        let base = arr2(&[[1.0, 0.3], [-1.0, -0.2]]);

        for loss in &losses {
            let grad = loss.gradient(&base.view(), &targets.view()).unwrap();
            for i in 0..2 {
                for j in 0..2 {
                    let eps = 1e-6;
                    let mut bumped = base.clone();
                    bumped[[i, j]] += eps;
                    let f0 = loss.compute(&base.view(), &targets.view()).unwrap();
                    let f1 = loss.compute(&bumped.view(), &targets.view()).unwrap();
                    let numeric = (f1 - f0) / eps;
                    assert!(
                        (grad[[i, j]] - numeric).abs() < 1e-4,
                        "{} grad[{},{}]: {} vs {}",
                        loss.name(),
                        i,
                        j,
                        grad[[i, j]],
                        numeric
                    );
                }
            }
        }
    }

    #[test]
    fn test_cross_entropy_correct_class_lowers_loss() {
        let loss = CrossEntropyLoss { n_classes: 2 };
        let targets = arr1(&[1.0]);

        let right = arr2(&[[-2.0, 2.0]]);
        let wrong = arr2(&[[2.0, -2.0]]);
        let l_right = loss.compute(&right.view(), &targets.view()).unwrap();
        let l_wrong = loss.compute(&wrong.view(), &targets.view()).unwrap();
        assert!(l_right < l_wrong);
    }

    #[test]
    fn test_cross_entropy_gradient_sums_to_zero_per_row() {
        let loss = CrossEntropyLoss { n_classes: 3 };
        let preds = arr2(&[[0.1, 0.4, -0.3], [1.0, -1.0, 0.0]]);
        let targets = arr1(&[0.0, 2.0]);

        let grad = loss.gradient(&preds.view(), &targets.view()).unwrap();
        for i in 0..2 {
            let row_sum: f64 = (0..3).map(|j| grad[[i, j]]).sum();
            assert!(row_sum.abs() < 1e-12);
        }
    }

    #[test]
    fn test_cross_entropy_rejects_bad_class() {
        let loss = CrossEntropyLoss { n_classes: 2 };
        let preds = arr2(&[[0.0, 0.0]]);
        assert!(loss.compute(&preds.view(), &arr1(&[2.0]).view()).is_err());
        assert!(loss.compute(&preds.view(), &arr1(&[0.5]).view()).is_err());
    }

    #[test]
    fn test_robust_cross_entropy_gradient_finite_difference() {
        let loss = RobustCrossEntropyLoss { n_classes: 2 };
        let base = arr2(&[[0.5, -0.5, 0.1, -0.1]]);
        let targets = arr1(&[0.0]);

        let grad = loss.gradient(&base.view(), &targets.view()).unwrap();
        for j in 0..4 {
            let eps = 1e-6;
            let mut bumped = base.clone();
            bumped[[0, j]] += eps;
            let f0 = loss.compute(&base.view(), &targets.view()).unwrap();
            let f1 = loss.compute(&bumped.view(), &targets.view()).unwrap();
            assert!((grad[[0, j]] - (f1 - f0) / eps).abs() < 1e-4);
        }
    }

    #[test]
    fn test_resolve_loss_names() {
        assert_eq!(resolve_loss(LossKind::L1, false, 2).name(), "L1");
        assert_eq!(resolve_loss(LossKind::L1, true, 2).name(), "RobustL1");
        assert_eq!(resolve_loss(LossKind::L2, true, 2).name(), "RobustL2");
        assert_eq!(
            resolve_loss(LossKind::CrossEntropy, true, 2).name(),
            "RobustCrossEntropy"
        );
    }
}
