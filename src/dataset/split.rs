//! Seeded train/validation split and per-epoch shuffling
//!
//! The split is deterministic for a given seed. Training order is reshuffled
//! every epoch from a seed derived from the run seed and the epoch index, so
//! a restarted run sees the same sequence.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{CoTrainError, Result};

/// Sample indices assigned to each phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub seed: u64,
}

impl DatasetSplit {
    /// Shuffle `0..len` and cut at `floor(ratio * len)`.
    ///
    /// Both sides must end up non-empty.
    pub fn new(len: usize, ratio: f64, seed: u64) -> Result<Self> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(CoTrainError::Config(format!(
                "split ratio must lie in (0, 1), got {}",
                ratio
            )));
        }

        let train_len = (ratio * len as f64).floor() as usize;
        if train_len == 0 || train_len == len {
            return Err(CoTrainError::Config(format!(
                "split ratio {} over {} samples leaves an empty phase ({} train / {} validation)",
                ratio,
                len,
                train_len,
                len - train_len
            )));
        }

        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let validation = indices.split_off(train_len);
        Ok(Self {
            train: indices,
            validation,
            seed,
        })
    }

    /// Training order for `epoch`
    pub fn train_order(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.train.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(1 + epoch as u64));
        order.shuffle(&mut rng);
        order
    }

    /// Validation order; fixed across epochs
    pub fn validation_order(&self) -> Vec<usize> {
        self.validation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes_and_disjointness() {
        let split = DatasetSplit::new(10, 0.9, 42).unwrap();
        assert_eq!(split.train.len(), 9);
        assert_eq!(split.validation.len(), 1);

        let mut all: Vec<usize> = split.train.iter().chain(&split.validation).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_deterministic() {
        assert_eq!(DatasetSplit::new(20, 0.8, 7).unwrap(), DatasetSplit::new(20, 0.8, 7).unwrap());
    }

    #[test]
    fn test_two_samples_split_evenly() {
        let split = DatasetSplit::new(2, 0.5, 42).unwrap();
        assert_eq!(split.train.len(), 1);
        assert_eq!(split.validation.len(), 1);
    }

    #[test]
    fn test_empty_phase_rejected() {
        assert!(matches!(DatasetSplit::new(1, 0.9, 42), Err(CoTrainError::Config(_))));
        assert!(DatasetSplit::new(10, 1.0, 42).is_err());
    }

    #[test]
    fn test_train_order_is_permutation() {
        let split = DatasetSplit::new(30, 0.9, 3).unwrap();
        let mut order = split.train_order(5);
        assert_eq!(order, split.train_order(5));
        order.sort_unstable();
        let mut expected = split.train.clone();
        expected.sort_unstable();
        assert_eq!(order, expected);
    }
}
