//! Backend abstraction - Multi-backend support
//!
//! Selects CUDA (GPU) or NdArray (CPU) at compile time and resolves configured
//! [`DeviceSlot`]s to concrete devices of the selected backend.

use burn::backend::Autodiff;

use crate::config::DeviceSlot;
use crate::utils::error::{CoTrainError, Result};

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA (preferred) or NdArray (fallback)
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("At least one backend (cuda, ndarray, or cpu) must be enabled!");

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Concrete device type of the selected backend
pub type Device = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// Get the default device
pub fn default_device() -> Device {
    Device::default()
}

/// Resolve a configured slot to a device of the compiled backend
#[cfg(feature = "cuda")]
pub fn resolve_device(slot: DeviceSlot) -> Result<Device> {
    match slot {
        DeviceSlot::Default => Ok(default_device()),
        DeviceSlot::Gpu(index) => Ok(burn_cuda::CudaDevice::new(index)),
        DeviceSlot::Cpu => Err(CoTrainError::DevicePlacement {
            model: "backend".to_string(),
            expected: slot.to_string(),
            actual: backend_name().to_string(),
        }),
    }
}

/// Resolve a configured slot to a device of the compiled backend
#[cfg(not(feature = "cuda"))]
pub fn resolve_device(slot: DeviceSlot) -> Result<Device> {
    match slot {
        DeviceSlot::Default | DeviceSlot::Cpu => Ok(default_device()),
        DeviceSlot::Gpu(_) => Err(CoTrainError::DevicePlacement {
            model: "backend".to_string(),
            expected: slot.to_string(),
            actual: backend_name().to_string(),
        }),
    }
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
    {
        "NdArray (CPU)"
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_slots_resolve() {
        assert!(resolve_device(DeviceSlot::Default).is_ok());
        assert!(resolve_device(DeviceSlot::Cpu).is_ok());
    }

    #[test]
    fn test_gpu_slot_rejected_on_cpu_backend() {
        let err = resolve_device(DeviceSlot::Gpu(1)).unwrap_err();
        assert!(matches!(err, CoTrainError::DevicePlacement { .. }));
    }
}
