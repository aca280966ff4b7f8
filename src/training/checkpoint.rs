//! Per-sub-model checkpoint tracking.
//!
//! Each trainable model gets its own [`CheckpointTracker`]:
//! - `<name>_bw.mpk` holds the weights with the lowest validation loss so far and is
//!   rewritten only on strict improvement
//! - `<name>.mpk` holds the latest weights, written every `save_interval` epochs and at run end
//!
//! A JSON sidecar next to each file records the epoch and loss it was written at.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::error::{CoTrainError, Result};

/// Suffix of the best-weights file stem
pub const BEST_SUFFIX: &str = "_bw";
/// Extension written by `CompactRecorder`
pub const WEIGHTS_EXTENSION: &str = "mpk";

/// Append the weights extension unless the path already ends in it.
///
/// Unlike `Path::with_extension`, dots inside the stem (`M0.v2`) are kept.
pub fn weights_file(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == WEIGHTS_EXTENSION) {
        return path.to_path_buf();
    }
    let mut file = path.as_os_str().to_owned();
    file.push(".");
    file.push(WEIGHTS_EXTENSION);
    PathBuf::from(file)
}

/// Metadata written next to a weights file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMeta {
    pub model: String,
    pub epoch: usize,
    /// Validation loss for best-weight files, absent for latest-weight files
    pub val_loss: Option<f64>,
    pub timestamp: String,
}

impl CheckpointMeta {
    fn new(model: &str, epoch: usize, val_loss: Option<f64>) -> Self {
        Self {
            model: model.to_string(),
            epoch,
            val_loss,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Best and latest weights of one trainable model
#[derive(Debug)]
pub struct CheckpointTracker<B: Backend, M: Module<B>> {
    name: String,
    directory: PathBuf,
    save_interval: usize,
    best_val_loss: f64,
    best_epoch: Option<usize>,
    best_weights: Option<M>,
    best_saves: usize,
    latest_saves: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> CheckpointTracker<B, M> {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, save_interval: usize) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            save_interval: save_interval.max(1),
            best_val_loss: f64::INFINITY,
            best_epoch: None,
            best_weights: None,
            best_saves: 0,
            latest_saves: 0,
            _backend: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowest validation loss observed; `+inf` before the first improvement
    pub fn best_val_loss(&self) -> f64 {
        self.best_val_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best_weights(&self) -> Option<&M> {
        self.best_weights.as_ref()
    }

    pub fn best_saves(&self) -> usize {
        self.best_saves
    }

    pub fn latest_saves(&self) -> usize {
        self.latest_saves
    }

    /// `<dir>/<name>_bw.mpk`
    pub fn best_path(&self) -> PathBuf {
        weights_file(&self.stem(&format!("{}{}", self.name, BEST_SUFFIX)))
    }

    /// `<dir>/<name>.mpk`
    pub fn latest_path(&self) -> PathBuf {
        weights_file(&self.stem(&self.name))
    }

    fn stem(&self, file_stem: &str) -> PathBuf {
        self.directory.join(file_stem)
    }

    fn write(&self, file_stem: &str, model: &M, meta: &CheckpointMeta) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        let file = weights_file(&self.stem(file_stem));
        model
            .clone()
            .save_file(&file, &CompactRecorder::new())
            .map_err(|e| CoTrainError::Checkpoint(format!("Failed to save {}: {}", file.display(), e)))?;
        meta.save(&self.stem(&format!("{file_stem}.json")))
    }

    /// Record a validation loss; snapshot and persist on strict improvement.
    ///
    /// Returns whether the best weights changed. NaN never improves.
    pub fn observe(&mut self, epoch: usize, val_loss: f64, model: &M) -> Result<bool> {
        if !(val_loss < self.best_val_loss) {
            debug!(
                "{}: val loss {:.6} did not improve on {:.6}",
                self.name, val_loss, self.best_val_loss
            );
            return Ok(false);
        }

        self.best_val_loss = val_loss;
        self.best_epoch = Some(epoch);
        self.best_weights = Some(model.clone());

        let stem = format!("{}{}", self.name, BEST_SUFFIX);
        self.write(&stem, model, &CheckpointMeta::new(&self.name, epoch, Some(val_loss)))?;
        self.best_saves += 1;
        info!(
            "Saved best {} weights (epoch {}, val loss {:.6}) to {}",
            self.name,
            epoch,
            val_loss,
            self.best_path().display()
        );
        Ok(true)
    }

    /// Whether `epoch` falls on the save cadence
    pub fn is_save_epoch(&self, epoch: usize) -> bool {
        epoch % self.save_interval == 0
    }

    /// Persist the latest weights when `epoch` is on the cadence
    pub fn periodic_save(&mut self, epoch: usize, model: &M) -> Result<bool> {
        if !self.is_save_epoch(epoch) {
            return Ok(false);
        }
        self.save_latest(epoch, model)?;
        Ok(true)
    }

    /// Persist the latest weights unconditionally
    pub fn save_latest(&mut self, epoch: usize, model: &M) -> Result<()> {
        let name = self.name.clone();
        self.write(&name, model, &CheckpointMeta::new(&name, epoch, None))?;
        self.latest_saves += 1;
        debug!("Saved latest {} weights (epoch {})", self.name, epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::{Linear, LinearConfig};
    use tempfile::tempdir;

    type TestBackend = NdArray;
    type Tracker = CheckpointTracker<TestBackend, Linear<TestBackend>>;

    fn model() -> Linear<TestBackend> {
        LinearConfig::new(2, 2).init(&Default::default())
    }

    #[test]
    fn test_best_loss_is_monotone() {
        let dir = tempdir().unwrap();
        let mut tracker = Tracker::new("M1", dir.path(), 10);
        let m = model();

        let mut previous = tracker.best_val_loss();
        assert!(previous.is_infinite());
        for (epoch, loss) in [0.8, 0.9, 0.5, f64::NAN, 0.5, 0.7, 0.2].into_iter().enumerate() {
            tracker.observe(epoch, loss, &m).unwrap();
            assert!(tracker.best_val_loss() <= previous);
            previous = tracker.best_val_loss();
        }

        assert_eq!(tracker.best_val_loss(), 0.2);
        assert_eq!(tracker.best_epoch(), Some(6));
        // 0.8, 0.5 and 0.2 are strict improvements; the repeated 0.5 is not.
        assert_eq!(tracker.best_saves(), 3);
        assert!(tracker.best_path().is_file());
        assert!(tracker.best_weights().is_some());

        let meta = CheckpointMeta::load(&tracker.best_path().with_extension("json")).unwrap();
        assert_eq!(meta.epoch, 6);
        assert_eq!(meta.val_loss, Some(0.2));
    }

    #[test]
    fn test_periodic_save_cadence() {
        let dir = tempdir().unwrap();
        let mut tracker = Tracker::new("M2", dir.path(), 3);
        let m = model();

        let saved: Vec<usize> = (0..10)
            .filter(|&epoch| tracker.periodic_save(epoch, &m).unwrap())
            .collect();

        assert_eq!(saved, vec![0, 3, 6, 9]);
        assert_eq!(tracker.latest_saves(), 4);
        assert_eq!(tracker.best_saves(), 0);
        assert!(tracker.latest_path().ends_with("M2.mpk"));
        assert!(tracker.latest_path().is_file());
        assert!(!tracker.best_path().exists());
    }

    #[test]
    fn test_paths() {
        let tracker = Tracker::new("M1", "/ckpt", 10);
        assert_eq!(tracker.best_path(), PathBuf::from("/ckpt/M1_bw.mpk"));
        assert_eq!(tracker.latest_path(), PathBuf::from("/ckpt/M1.mpk"));
    }

    #[test]
    fn test_dotted_names_keep_their_stem() {
        assert_eq!(weights_file(Path::new("/w/M0.v2")), PathBuf::from("/w/M0.v2.mpk"));
        assert_eq!(weights_file(Path::new("/w/M0.v2.mpk")), PathBuf::from("/w/M0.v2.mpk"));

        let dir = tempdir().unwrap();
        let mut tracker = Tracker::new("M1.v2", dir.path(), 1);
        tracker.save_latest(0, &model()).unwrap();
        tracker.observe(0, 0.4, &model()).unwrap();

        assert!(dir.path().join("M1.v2.mpk").is_file());
        assert!(dir.path().join("M1.v2_bw.mpk").is_file());
        assert!(dir.path().join("M1.v2.json").is_file());
        assert!(!dir.path().join("M1.mpk").exists());
    }
}
