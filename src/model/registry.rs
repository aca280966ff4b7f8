//! Model registry and device slots
//!
//! Builds the three cooperating models, pins each to its configured device,
//! and provides the checked hand-off every cross-model tensor transfer goes
//! through.

use std::fmt::Debug;
use std::path::Path;

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::model::registration::{RegistrationNet, RegistrationNetConfig};
use crate::model::unet::{SliceUNet, SliceUNetConfig};
use crate::training::checkpoint::weights_file;
use crate::utils::error::{CoTrainError, Result};

/// Role names used in logs and errors
pub const REFERENCE: &str = "reference";
pub const REGISTRATION: &str = "registration";
pub const SEGMENTATION: &str = "segmentation";

/// One device per model role
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMap<D> {
    pub reference: D,
    pub registration: D,
    pub segmentation: D,
}

impl<D: Clone> DeviceMap<D> {
    /// All three roles on one device
    pub fn uniform(device: D) -> Self {
        Self {
            reference: device.clone(),
            registration: device.clone(),
            segmentation: device,
        }
    }
}

/// Fail unless `actual` is the device the slot requires
pub fn check_placement<D: PartialEq + Debug>(model: &str, expected: &D, actual: &D) -> Result<()> {
    if expected != actual {
        return Err(CoTrainError::DevicePlacement {
            model: model.to_string(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        });
    }
    Ok(())
}

/// Move `tensor` to `target` and verify it arrived.
pub fn hand_off<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    target: &B::Device,
    model: &str,
) -> Result<Tensor<B, D>> {
    let moved = tensor.to_device(target);
    check_placement(model, target, &moved.device())?;
    Ok(moved)
}

/// Verify every parameter of `module` lives on `expected`
pub fn verify_module_placement<B: Backend, M: Module<B>>(
    module: &M,
    expected: &B::Device,
    model: &str,
) -> Result<()> {
    for device in module.devices() {
        check_placement(model, expected, &device)?;
    }
    Ok(())
}

/// The two trainable models, optimized together by one optimizer
#[derive(Module, Debug)]
pub struct CoTrainModels<B: Backend> {
    pub registration: RegistrationNet<B>,
    pub segmentation: SliceUNet<B>,
}

impl<B: Backend> CoTrainModels<B> {
    /// Fresh models on their slot devices
    pub fn init(config: &RunConfig, devices: &DeviceMap<B::Device>) -> Self {
        let base = config.model.base_filters;
        Self {
            registration: RegistrationNetConfig::for_mode(
                config.training.warp_mode,
                base,
                config.training.max_displacement,
            )
            .init(&devices.registration),
            segmentation: SliceUNetConfig::new()
                .with_base_filters(base)
                .init(&devices.segmentation),
        }
    }

    /// Check both models against their slots
    pub fn verify_placement(&self, devices: &DeviceMap<B::Device>) -> Result<()> {
        verify_module_placement(&self.registration, &devices.registration, REGISTRATION)?;
        verify_module_placement(&self.segmentation, &devices.segmentation, SEGMENTATION)
    }
}

/// Build the frozen reference model.
///
/// Loads `weights` (a CompactRecorder file, extension optional) when given,
/// otherwise initializes randomly and warns.
pub fn load_reference<B: Backend>(
    config: &RunConfig,
    weights: Option<&Path>,
    device: &B::Device,
) -> Result<SliceUNet<B>> {
    let model = SliceUNetConfig::new()
        .with_base_filters(config.model.base_filters)
        .init::<B>(device);

    let Some(path) = weights else {
        warn!("No reference weights configured; the reference model is randomly initialized");
        return Ok(model);
    };

    let file = weights_file(path);
    if !file.is_file() {
        return Err(CoTrainError::MissingFile(file));
    }

    let model = model
        .load_file(&file, &CompactRecorder::new(), device)
        .map_err(|e| CoTrainError::Checkpoint(format!("Failed to load reference weights {}: {}", file.display(), e)))?;
    info!("Loaded reference weights from {}", file.display());
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn small_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.model.base_filters = 2;
        config
    }

    #[test]
    fn test_check_placement() {
        assert!(check_placement("segmentation", &1usize, &1usize).is_ok());
        let err = check_placement("segmentation", &0usize, &1usize).unwrap_err();
        match err {
            CoTrainError::DevicePlacement { model, expected, actual } => {
                assert_eq!(model, "segmentation");
                assert_eq!(expected, "0");
                assert_eq!(actual, "1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hand_off_same_device() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 2>::ones([2, 2], &device);
        assert!(hand_off(t, &device, SEGMENTATION).is_ok());
    }

    #[test]
    fn test_models_placed_on_slots() {
        let devices = DeviceMap::uniform(Default::default());
        let models = CoTrainModels::<TestBackend>::init(&small_config(), &devices);
        assert!(models.verify_placement(&devices).is_ok());
    }

    #[test]
    fn test_reference_weights_roundtrip() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let config = small_config();

        let reference = load_reference::<TestBackend>(&config, None, &device).unwrap();
        let path = dir.path().join("M0_bw");
        reference
            .clone()
            .save_file(&path, &CompactRecorder::new())
            .unwrap();

        assert!(load_reference::<TestBackend>(&config, Some(&path), &device).is_ok());
    }

    #[test]
    fn test_reference_weights_with_dotted_stem() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let config = small_config();

        let reference = load_reference::<TestBackend>(&config, None, &device).unwrap();
        reference
            .save_file(dir.path().join("M0.v2.mpk"), &CompactRecorder::new())
            .unwrap();
        assert!(dir.path().join("M0.v2.mpk").is_file());
        assert!(!dir.path().join("M0.mpk").exists());

        for given in ["M0.v2", "M0.v2.mpk"] {
            assert!(load_reference::<TestBackend>(&config, Some(&dir.path().join(given)), &device).is_ok());
        }
    }

    #[test]
    fn test_missing_reference_weights() {
        let device = Default::default();
        let err = load_reference::<TestBackend>(&small_config(), Some(Path::new("/nonexistent/M0")), &device)
            .unwrap_err();
        assert!(matches!(err, CoTrainError::MissingFile(_)));
    }
}
