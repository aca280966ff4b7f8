//! Run configuration
//!
//! Every path, shape, cadence and device assignment used by a co-training run
//! is carried by [`RunConfig`]. It is loaded from TOML, validated once, and
//! handed to the dataset, model registry and trainer at construction.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::training::scaler::ScalerConfig;
use crate::training::warp::WarpMode;
use crate::utils::error::{CoTrainError, Result};

/// Top-level configuration for one co-training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Dataset root; holds `images/`, `gt/`, `ct/` and the index file
    pub dataset_root: PathBuf,
    /// Index file name, relative to `dataset_root`
    pub index_file: String,
    /// Spatial shape `[depth, height, width]` every volume is cropped or padded to
    pub output_shape: [usize; 3],
    /// Depth of the stored slice stacks before cropping
    pub source_depth: usize,
    pub batch_size: usize,
    pub epochs: usize,
    /// Fraction of samples assigned to the training split
    pub split_ratio: f64,
    pub seed: u64,
    /// Raw label intensity at or above which a voxel is foreground
    pub label_threshold: f32,
    pub checkpoints: CheckpointConfig,
    /// Root directory for timestamped run logs
    pub log_root: PathBuf,
    pub device_map: DeviceMapConfig,
    pub training: CoTrainingConfig,
    pub scaler: ScalerConfig,
    pub model: ModelConfig,
    /// Show indicatif progress bars
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("data/chaos"),
            index_file: "dataset.csv".to_string(),
            output_shape: [32, 128, 128],
            source_depth: 32,
            batch_size: 1,
            epochs: 1000,
            split_ratio: 0.9,
            seed: 42,
            label_threshold: 240.0,
            checkpoints: CheckpointConfig::default(),
            log_root: PathBuf::from("runs"),
            device_map: DeviceMapConfig::default(),
            training: CoTrainingConfig::default(),
            scaler: ScalerConfig::default(),
            model: ModelConfig::default(),
            show_progress: true,
        }
    }
}

impl RunConfig {
    /// Load a configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CoTrainError::Config(format!("Failed to read config {}: {e}", path.display())))?;

        toml::from_str(&content)
            .map_err(|e| CoTrainError::Config(format!("Failed to parse config {}: {e}", path.display())))
    }

    /// Write this configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoTrainError::Serialization(format!("Failed to encode config: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Full path of the dataset index file
    pub fn index_path(&self) -> PathBuf {
        self.dataset_root.join(&self.index_file)
    }

    /// Reject configurations that cannot produce a run
    pub fn validate(&self) -> Result<()> {
        if self.output_shape.iter().any(|&d| d == 0) {
            return Err(CoTrainError::Config(format!(
                "output_shape must be positive in every dimension, got {:?}",
                self.output_shape
            )));
        }
        if self.output_shape[1] % 2 != 0 || self.output_shape[2] % 2 != 0 {
            return Err(CoTrainError::Config(format!(
                "output_shape height and width must be even, got {:?}",
                self.output_shape
            )));
        }
        if self.source_depth == 0 {
            return Err(CoTrainError::Config("source_depth must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(CoTrainError::Config("batch_size must be > 0".to_string()));
        }
        if self.epochs == 0 {
            return Err(CoTrainError::Config("epochs must be > 0".to_string()));
        }
        if !(self.split_ratio > 0.0 && self.split_ratio < 1.0) {
            return Err(CoTrainError::Config(format!(
                "split_ratio must lie in (0, 1), got {}",
                self.split_ratio
            )));
        }
        if self.checkpoints.save_interval == 0 {
            return Err(CoTrainError::Config("checkpoints.save_interval must be > 0".to_string()));
        }
        if self.training.figure_interval == 0 {
            return Err(CoTrainError::Config("training.figure_interval must be > 0".to_string()));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(CoTrainError::Config("training.learning_rate must be > 0".to_string()));
        }
        if self.training.dice_smooth <= 0.0 {
            return Err(CoTrainError::Config("training.dice_smooth must be > 0".to_string()));
        }
        if self.model.base_filters == 0 {
            return Err(CoTrainError::Config("model.base_filters must be > 0".to_string()));
        }
        self.scaler.validate()?;

        let names = &self.checkpoints.names;
        if names.registration.is_empty() || names.segmentation.is_empty() {
            return Err(CoTrainError::Config("checkpoint names must not be empty".to_string()));
        }
        if names.registration == names.segmentation {
            return Err(CoTrainError::Config(format!(
                "registration and segmentation checkpoints share the name '{}'",
                names.registration
            )));
        }

        Ok(())
    }
}

/// Checkpoint locations and cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    pub names: CheckpointNames,
    /// Latest weights are written every `save_interval` epochs and at run end
    pub save_interval: usize,
    /// Pretrained weights for the frozen reference model
    pub reference_weights: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("checkpoints"),
            names: CheckpointNames::default(),
            save_interval: 10,
            reference_weights: None,
        }
    }
}

/// File stems for each sub-model (`<name>.mpk`, `<name>_bw.mpk`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointNames {
    pub reference: String,
    pub registration: String,
    pub segmentation: String,
}

impl Default for CheckpointNames {
    fn default() -> Self {
        Self {
            reference: "M0".to_string(),
            registration: "M1".to_string(),
            segmentation: "M2".to_string(),
        }
    }
}

/// A device assignment for one model.
///
/// Resolved to a concrete backend device by [`crate::backend::resolve_device`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSlot {
    /// The backend's default device
    #[default]
    Default,
    /// Host CPU
    Cpu,
    /// Accelerator by ordinal
    Gpu(usize),
}

impl std::fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSlot::Default => write!(f, "default"),
            DeviceSlot::Cpu => write!(f, "cpu"),
            DeviceSlot::Gpu(i) => write!(f, "gpu:{}", i),
        }
    }
}

/// Device slot per model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DeviceMapConfig {
    pub reference: DeviceSlot,
    pub registration: DeviceSlot,
    pub segmentation: DeviceSlot,
}

/// Which image the segmentation model sees
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationInput {
    /// The unwarped auxiliary image
    #[default]
    Auxiliary,
    /// The auxiliary image after warping
    Warped,
}

/// Co-training loop behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoTrainingConfig {
    pub learning_rate: f64,
    /// Registration passes after the first; 0 disables refinement
    pub refinement_passes: usize,
    /// Add the registration loss to the optimized total
    pub joint_registration_loss: bool,
    pub segmentation_input: SegmentationInput,
    /// Emit a figure panel every N epochs (first training batch only)
    pub figure_interval: usize,
    /// Dice smoothing constant
    pub dice_smooth: f64,
    /// Weight of the warp-field smoothness penalty in the registration loss
    pub smoothness_weight: f64,
    pub warp_mode: WarpMode,
    /// Largest displacement in voxels (displacement mode only)
    pub max_displacement: f64,
}

impl Default for CoTrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            refinement_passes: 1,
            joint_registration_loss: true,
            segmentation_input: SegmentationInput::Auxiliary,
            figure_interval: 5,
            dice_smooth: 1e-6,
            smoothness_weight: 0.01,
            warp_mode: WarpMode::Multiplicative,
            max_displacement: 4.0,
        }
    }
}

/// Network sizing shared by the three models
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub base_filters: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { base_filters: 16 }
    }
}
