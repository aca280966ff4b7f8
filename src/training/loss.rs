//! Composite loss: soft Dice for segmentation, similarity plus smoothness for registration

use burn::prelude::*;

use crate::training::warp::{check_aligned, WarpField};
use crate::utils::error::{CoTrainError, Result};

/// Soft Dice loss and its overlap score
#[derive(Debug, Clone)]
pub struct DiceOutput<B: Backend> {
    /// `1 - dice`, differentiable
    pub loss: Tensor<B, 1>,
    /// The Dice coefficient, detached
    pub dice: Tensor<B, 1>,
}

/// `1 - (2·Σ(p·t) + ε) / (Σp + Σt + ε)` over the whole batch.
///
/// `prediction` and `target` are probabilities in [0, 1] and must have equal shapes.
pub fn dice_loss<B: Backend, const D: usize>(
    prediction: Tensor<B, D>,
    target: Tensor<B, D>,
    smooth: f64,
) -> Result<DiceOutput<B>> {
    let (p_dims, t_dims) = (prediction.dims(), target.dims());
    if p_dims != t_dims {
        return Err(CoTrainError::shape_mismatch("dice loss", &t_dims, &p_dims));
    }

    let intersection = (prediction.clone() * target.clone()).sum();
    let total = prediction.sum() + target.sum();
    let dice = intersection.mul_scalar(2.0).add_scalar(smooth) / total.add_scalar(smooth);

    Ok(DiceOutput {
        loss: dice.clone().neg().add_scalar(1.0),
        dice: dice.detach(),
    })
}

/// Mean of squared finite differences along every spatial axis longer than one voxel
pub fn smoothness_penalty<B: Backend>(field: &WarpField<B>) -> Tensor<B, 1> {
    let tensor = field.tensor.clone();
    let dims = tensor.dims();
    let device = tensor.device();

    let mut penalty = Tensor::<B, 1>::zeros([1], &device);
    let mut axes = 0usize;
    for axis in 2..5 {
        let len = dims[axis];
        if len < 2 {
            continue;
        }
        let diff = tensor.clone().narrow(axis, 1, len - 1) - tensor.clone().narrow(axis, 0, len - 1);
        penalty = penalty + diff.powf_scalar(2.0).mean();
        axes += 1;
    }

    if axes > 1 {
        penalty.div_scalar(axes as f32)
    } else {
        penalty
    }
}

/// Registration terms for one batch
#[derive(Debug, Clone)]
pub struct RegistrationLoss<B: Backend> {
    pub similarity: Tensor<B, 1>,
    pub smoothness: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// `MSE(warped, fixed) + weight · smoothness(field)`
pub fn registration_loss<B: Backend>(
    warped: Tensor<B, 5>,
    fixed: Tensor<B, 5>,
    field: &WarpField<B>,
    smoothness_weight: f64,
) -> Result<RegistrationLoss<B>> {
    check_aligned("registration similarity", fixed.dims(), warped.dims())?;

    let similarity = (warped - fixed).powf_scalar(2.0).mean();
    let smoothness = smoothness_penalty(field);
    let total = similarity.clone() + smoothness.clone().mul_scalar(smoothness_weight);

    Ok(RegistrationLoss {
        similarity,
        smoothness,
        total,
    })
}
