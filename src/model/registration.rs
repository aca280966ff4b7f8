//! Registration network
//!
//! Predicts a [`WarpField`] aligning an auxiliary image to a primary image,
//! and exposes the combined warp-and-loss operation the co-training loop
//! calls once per batch.

use burn::{
    config::Config,
    module::Module,
    tensor::{activation, backend::Backend, Tensor},
};

use crate::model::unet::{SliceUNet, SliceUNetConfig};
use crate::training::loss::{registration_loss, RegistrationLoss};
use crate::training::warp::{check_aligned, synthesize, WarpField, WarpMode};
use crate::utils::error::Result as CoResult;

/// Configuration for [`RegistrationNet`]
#[derive(Config, Debug)]
pub struct RegistrationNetConfig {
    #[config(default = "16")]
    pub base_filters: usize,

    /// Predict a displacement field instead of a multiplicative one
    #[config(default = "false")]
    pub displacement: bool,

    /// Largest displacement in voxels (displacement mode only)
    #[config(default = "4.0")]
    pub max_displacement: f64,
}

impl RegistrationNetConfig {
    pub fn for_mode(mode: WarpMode, base_filters: usize, max_displacement: f64) -> Self {
        Self::new()
            .with_base_filters(base_filters)
            .with_displacement(mode == WarpMode::Displacement)
            .with_max_displacement(max_displacement)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> RegistrationNet<B> {
        let mode = if self.displacement {
            WarpMode::Displacement
        } else {
            WarpMode::Multiplicative
        };
        RegistrationNet {
            unet: SliceUNetConfig::new()
                .with_in_channels(2)
                .with_out_channels(mode.channels())
                .with_base_filters(self.base_filters)
                .init(device),
            displacement: self.displacement,
            max_displacement: self.max_displacement,
        }
    }
}

/// Options for one warp-and-loss call
#[derive(Debug, Clone, Copy)]
pub struct WarpOptions {
    /// Extra registration passes over the warped pair
    pub refinement_passes: usize,
    /// Keep the warped image and pseudo-label attached to the graph
    pub requires_grad: bool,
    pub smoothness_weight: f64,
}

/// Output of [`RegistrationNet::warp_and_loss`]
#[derive(Debug, Clone)]
pub struct WarpOutput<B: Backend> {
    pub loss: RegistrationLoss<B>,
    /// Auxiliary image warped by the final field
    pub warped: Tensor<B, 5>,
    /// Label warped by the final field, clamped to [0, 1]
    pub pseudo_label: Tensor<B, 5>,
    pub field: WarpField<B>,
}

#[derive(Module, Debug)]
pub struct RegistrationNet<B: Backend> {
    unet: SliceUNet<B>,
    displacement: bool,
    max_displacement: f64,
}

impl<B: Backend> RegistrationNet<B> {
    pub fn mode(&self) -> WarpMode {
        if self.displacement {
            WarpMode::Displacement
        } else {
            WarpMode::Multiplicative
        }
    }

    /// Predict the field from a `(moving, fixed)` pair of one-channel volumes
    pub fn forward(&self, moving: Tensor<B, 5>, fixed: Tensor<B, 5>) -> CoResult<WarpField<B>> {
        check_aligned("registration input", fixed.dims(), moving.dims())?;

        let raw = self.unet.forward(Tensor::cat(vec![moving, fixed], 1));
        let tensor = match self.mode() {
            WarpMode::Multiplicative => activation::sigmoid(raw).mul_scalar(2.0),
            WarpMode::Displacement => activation::tanh(raw).mul_scalar(self.max_displacement),
        };
        WarpField::new(tensor, self.mode())
    }

    /// Align `auxiliary` to `primary` and carry `label` along.
    ///
    /// The first field is predicted from `(primary, auxiliary)`. Each refinement
    /// pass predicts a new field from `(warped, auxiliary)` and reapplies it to
    /// the original auxiliary image and label.
    pub fn warp_and_loss(
        &self,
        auxiliary: Tensor<B, 5>,
        primary: Tensor<B, 5>,
        label: Tensor<B, 5>,
        options: WarpOptions,
    ) -> CoResult<WarpOutput<B>> {
        check_aligned("warp application (auxiliary vs primary)", primary.dims(), auxiliary.dims())?;
        check_aligned("warp application (label vs primary)", primary.dims(), label.dims())?;

        let apply = |field: &WarpField<B>| -> CoResult<(Tensor<B, 5>, Tensor<B, 5>)> {
            let warped = synthesize(field, auxiliary.clone(), options.requires_grad)?;
            let pseudo = synthesize(field, label.clone(), options.requires_grad)?.clamp(0.0, 1.0);
            Ok((warped, pseudo))
        };

        let mut field = self.forward(primary.clone(), auxiliary.clone())?;
        let (mut warped, mut pseudo_label) = apply(&field)?;

        for _ in 0..options.refinement_passes {
            field = self.forward(warped, auxiliary.clone())?;
            (warped, pseudo_label) = apply(&field)?;
        }

        let loss = registration_loss(warped.clone(), primary, &field, options.smoothness_weight)?;

        Ok(WarpOutput {
            loss,
            warped,
            pseudo_label,
            field,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::CoTrainError;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn options(refinement_passes: usize) -> WarpOptions {
        WarpOptions {
            refinement_passes,
            requires_grad: false,
            smoothness_weight: 0.01,
        }
    }

    #[test]
    fn test_multiplicative_field_range() {
        let device = Default::default();
        let net: RegistrationNet<TestBackend> = RegistrationNetConfig::new().with_base_filters(4).init(&device);
        let x = Tensor::<TestBackend, 5>::ones([1, 1, 2, 4, 4], &device);

        let field = net.forward(x.clone(), x).unwrap();
        assert_eq!(field.dims(), [1, 1, 2, 4, 4]);
        let values = field.tensor.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v > 0.0 && *v < 2.0));
    }

    #[test]
    fn test_displacement_field_is_bounded() {
        let device = Default::default();
        let net: RegistrationNet<TestBackend> =
            RegistrationNetConfig::for_mode(WarpMode::Displacement, 4, 1.5).init(&device);
        let x = Tensor::<TestBackend, 5>::ones([1, 1, 2, 4, 4], &device);

        let field = net.forward(x.clone(), x).unwrap();
        assert_eq!(field.mode, WarpMode::Displacement);
        assert_eq!(field.dims()[1], 3);
        let values = field.tensor.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() <= 1.5));
    }

    #[test]
    fn test_warp_and_loss_shapes_with_refinement() {
        let device = Default::default();
        let net: RegistrationNet<TestBackend> = RegistrationNetConfig::new().with_base_filters(4).init(&device);
        let x = Tensor::<TestBackend, 5>::ones([1, 1, 2, 4, 4], &device);

        for passes in [0, 2] {
            let out = net.warp_and_loss(x.clone(), x.clone(), x.clone(), options(passes)).unwrap();
            assert_eq!(out.warped.dims(), [1, 1, 2, 4, 4]);
            let pseudo = out.pseudo_label.into_data().to_vec::<f32>().unwrap();
            assert!(pseudo.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_misaligned_auxiliary_is_shape_mismatch() {
        let device = Default::default();
        let net: RegistrationNet<TestBackend> = RegistrationNetConfig::new().with_base_filters(4).init(&device);
        let primary = Tensor::<TestBackend, 5>::ones([1, 1, 2, 4, 4], &device);
        let auxiliary = Tensor::<TestBackend, 5>::ones([1, 1, 2, 4, 2], &device);

        let err = net
            .warp_and_loss(auxiliary, primary.clone(), primary, options(1))
            .unwrap_err();
        match err {
            CoTrainError::ShapeMismatch { context, .. } => assert!(context.contains("warp application")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
