//! Model definitions for the co-training pipeline
//!
//! - `unet`: slice-wise U-Net shared by all roles
//! - `registration`: warp-field prediction and the combined warp-and-loss operation
//! - `registry`: construction, reference loading, device slots and checked hand-off

pub mod registration;
pub mod registry;
pub mod unet;

pub use registration::{RegistrationNet, RegistrationNetConfig, WarpOptions, WarpOutput};
pub use registry::{hand_off, load_reference, CoTrainModels, DeviceMap};
pub use unet::{SliceUNet, SliceUNetConfig};
