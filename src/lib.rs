//! # Liver Segmentation by Warp-Supervised Co-Training
//!
//! A Rust library for semi-supervised cross-modality (MRI → CT) segmentation using the Burn framework.
//!
//! ## Features
//!
//! - **Pseudo-labels through registration**: a learned warp field carries MRI ground truth onto CT
//! - **Joint optimization** of the registration and segmentation models under one optimizer
//! - **Gradient scaling** as an explicit, injected object
//! - **Device slots** per model with checked tensor hand-off
//! - **Best/latest checkpoints** per trainable model
//!
//! ## Modules
//!
//! - `dataset`: Index parsing, volume transforms, batching and splits
//! - `model`: Slice-wise U-Net, registration network and the model registry
//! - `training`: Warp synthesis, losses, scaler, checkpoints, sinks and the co-training loop
//! - `config`: TOML run configuration
//! - `utils`: Errors, logging and charts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use liverseg_ssl::{CoTrainer, RunConfig, GradScaler, MemorySink};
//!
//! let config = RunConfig::load("run.toml".as_ref())?;
//! let mut trainer = CoTrainer::new(config, models, reference, optimizer, scaler, devices, source)?;
//! let summary = trainer.run(&mut MemorySink::new())?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::{DeviceSlot, RunConfig, SegmentationInput};
pub use dataset::{InMemoryVolumes, SampleSource, Volume, VolumeBatcher, VolumeDataset, VolumeItem};
pub use model::{CoTrainModels, DeviceMap, RegistrationNet, SliceUNet};
pub use training::{
    CheckpointTracker, CoTrainer, FileSink, GradScaler, MemorySink, MetricsSink, RunSummary, ScalerConfig,
    WarpField, WarpMode,
};
pub use utils::error::{CoTrainError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
