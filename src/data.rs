//! Data-loader collaborator contract.
//!
//! Featurization and dataset construction live outside this crate; training
//! only needs a finite, restartable sequence of batches whose inputs,
//! targets, sample ids and human-readable keys are aligned by position. The
//! ensemble aggregator relies on every member iterating the identical,
//! order-preserved sample sequence.

use crate::{TrainError, TrainResult};
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One batch of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Feature matrix, one row per sample.
    pub inputs: Array2<f64>,
    /// Scalar targets (regression values or class indices), one per sample.
    pub targets: Array1<f64>,
    /// Sample identifiers.
    pub ids: Vec<String>,
    /// Human-readable keys (e.g. composition strings).
    pub keys: Vec<String>,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// A finite, restartable source of batches.
pub trait DataLoader {
    /// Iterate once over all batches. Every call yields the same sequence.
    fn batches(&self) -> Box<dyn Iterator<Item = Batch>>;

    /// Total number of samples.
    fn num_samples(&self) -> usize;

    /// Whether the loader holds no samples.
    fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }
}

/// In-memory data loader over pre-featurized samples.
///
/// Iteration order is deterministic: insertion order by default, or a fixed
/// seeded permutation when shuffling is enabled. Test loaders must not
/// shuffle so that ensemble members see samples in the same positions.
#[derive(Debug, Clone)]
pub struct InMemoryDataLoader {
    inputs: Array2<f64>,
    targets: Array1<f64>,
    ids: Vec<String>,
    keys: Vec<String>,
    batch_size: usize,
    order: Vec<usize>,
}

impl InMemoryDataLoader {
    /// Create a loader over aligned sample arrays.
    pub fn new(
        inputs: Array2<f64>,
        targets: Array1<f64>,
        ids: Vec<String>,
        keys: Vec<String>,
        batch_size: usize,
    ) -> TrainResult<Self> {
        let n = inputs.nrows();
        if targets.len() != n || ids.len() != n || keys.len() != n {
            return Err(TrainError::Data(format!(
                "misaligned loader arrays: {} inputs, {} targets, {} ids, {} keys",
                n,
                targets.len(),
                ids.len(),
                keys.len()
            )));
        }
        if batch_size == 0 {
            return Err(TrainError::Data("batch size must be positive".into()));
        }

        Ok(Self {
            inputs,
            targets,
            ids,
            keys,
            batch_size,
            order: (0..n).collect(),
        })
    }

    /// Create a loader without ids/keys, numbering samples 0..n.
    pub fn from_arrays(
        inputs: Array2<f64>,
        targets: Array1<f64>,
        batch_size: usize,
    ) -> TrainResult<Self> {
        let n = inputs.nrows();
        let ids: Vec<String> = (0..n).map(|i| i.to_string()).collect();
        let keys = ids.clone();
        Self::new(inputs, targets, ids, keys, batch_size)
    }

    /// Fix a seeded shuffled iteration order. The permutation is computed
    /// once, so repeated iteration stays restartable and deterministic.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self
    }

    /// All targets, in iteration order. Used to fit the normalizer.
    pub fn targets(&self) -> Vec<f64> {
        self.order.iter().map(|&i| self.targets[i]).collect()
    }
}

impl DataLoader for InMemoryDataLoader {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch>> {
        let mut batches = Vec::with_capacity(self.order.len().div_ceil(self.batch_size));
        for chunk in self.order.chunks(self.batch_size) {
            let inputs = self.inputs.select(Axis(0), chunk);
            let targets = Array1::from_iter(chunk.iter().map(|&i| self.targets[i]));
            let ids = chunk.iter().map(|&i| self.ids[i].clone()).collect();
            let keys = chunk.iter().map(|&i| self.keys[i].clone()).collect();
            batches.push(Batch {
                inputs,
                targets,
                ids,
                keys,
            });
        }
        Box::new(batches.into_iter())
    }

    fn num_samples(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn loader(n: usize, batch_size: usize) -> InMemoryDataLoader {
        let inputs = Array2::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f64);
        let targets = Array1::from_iter((0..n).map(|i| i as f64));
        InMemoryDataLoader::from_arrays(inputs, targets, batch_size).unwrap()
    }

    #[test]
    fn test_batches_cover_all_samples_in_order() {
        let loader = loader(7, 3);
        let batches: Vec<Batch> = loader.batches().collect();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2].len(), 1);

        let seen: Vec<f64> = batches.iter().flat_map(|b| b.targets.to_vec()).collect();
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let loader = loader(5, 2).with_shuffle(42);
        let first: Vec<f64> = loader.batches().flat_map(|b| b.targets.to_vec()).collect();
        let second: Vec<f64> = loader.batches().flat_map(|b| b.targets.to_vec()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_shuffle_permutes_targets() {
        let plain = loader(20, 4);
        let shuffled = loader(20, 4).with_shuffle(7);
        assert_ne!(plain.targets(), shuffled.targets());

        let mut sorted = shuffled.targets();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, plain.targets());
    }

    #[test]
    fn test_misaligned_arrays_rejected() {
        let inputs = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let targets = Array1::from_vec(vec![1.0]);
        assert!(InMemoryDataLoader::from_arrays(inputs, targets, 2).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let inputs = arr2(&[[1.0, 2.0]]);
        let targets = Array1::from_vec(vec![1.0]);
        assert!(InMemoryDataLoader::from_arrays(inputs, targets, 0).is_err());
    }
}
