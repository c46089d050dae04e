//! Target normalization.
//!
//! A [`Normalizer`] is fit exactly once per run on the training-target
//! distribution (or restored from a checkpoint on resume) and the same fitted
//! parameters are applied to train, validation and test targets alike.

use crate::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};

/// Affine mean/std transform over scalar targets.
///
/// `transform` and `inverse_transform` are exact inverses; the state is two
/// scalars and round-trips bit-for-bit through serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    mean: f64,
    std: f64,
}

impl Normalizer {
    /// Identity transform (mean 0, std 1). Used for classification targets,
    /// which are never normalized.
    pub fn identity() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
        }
    }

    /// Fit mean and sample standard deviation from training targets.
    ///
    /// Fails with [`TrainError::DegenerateNormalization`] on empty input or
    /// when the resulting std is zero or non-finite. Callers that want to
    /// proceed anyway must opt into [`Normalizer::fit_with_fallback`].
    pub fn fit(targets: &[f64]) -> TrainResult<Self> {
        if targets.is_empty() {
            return Err(TrainError::DegenerateNormalization(
                "cannot fit normalizer on empty target set".into(),
            ));
        }

        let n = targets.len() as f64;
        let mean = targets.iter().sum::<f64>() / n;
        let std = if targets.len() < 2 {
            0.0
        } else {
            let var = targets.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt()
        };

        if std == 0.0 || !std.is_finite() {
            return Err(TrainError::DegenerateNormalization(format!(
                "target std is {} (n = {})",
                std,
                targets.len()
            )));
        }

        Ok(Self { mean, std })
    }

    /// Fit, substituting std = 1 when the target distribution is degenerate.
    ///
    /// The substitution is deliberate policy, not a silent default: a warning
    /// is logged and training proceeds on centered-but-unscaled targets.
    /// Empty input still fails.
    pub fn fit_with_fallback(targets: &[f64]) -> TrainResult<Self> {
        match Self::fit(targets) {
            Ok(normalizer) => Ok(normalizer),
            Err(TrainError::DegenerateNormalization(msg)) if !targets.is_empty() => {
                log::warn!("degenerate target distribution ({}); substituting std = 1", msg);
                let mean = targets.iter().sum::<f64>() / targets.len() as f64;
                Ok(Self { mean, std: 1.0 })
            }
            Err(e) => Err(e),
        }
    }

    /// Normalize one target value.
    pub fn transform(&self, x: f64) -> f64 {
        (x - self.mean) / self.std
    }

    /// Map a normalized prediction back to target units.
    pub fn inverse_transform(&self, y: f64) -> f64 {
        y * self.std + self.mean
    }

    /// Map a predicted standard deviation back to target units.
    ///
    /// Standard deviations scale without the mean shift.
    pub fn denormalize_std(&self, std: f64) -> f64 {
        std * self.std
    }

    /// Fitted mean.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Fitted standard deviation. Invariant: always positive and finite.
    pub fn std(&self) -> f64 {
        self.std
    }
}
