//! Warp fields and pseudo-label synthesis
//!
//! A [`WarpField`] comes out of the registration model and is applied to an
//! auxiliary image or a ground-truth label to produce a warped image or a
//! pseudo-label. Two operators are supported:
//!
//! - `Multiplicative`: a one-channel gain map, `out = W ⊙ L`. Identity is all ones.
//! - `Displacement`: a three-channel voxel offset `(dz, dy, dx)`; `L` is resampled
//!   trilinearly at `p + W(p)` with coordinates clamped to the volume. Identity is all zeros.
//!
//! Both are differentiable with respect to the field. The `requires_grad` flag
//! detaches the result when it is consumed only as a frozen target.

use burn::prelude::*;
use burn::tensor::Int;
use serde::{Deserialize, Serialize};

use crate::utils::error::{CoTrainError, Result};

/// How a warp field acts on a volume
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarpMode {
    #[default]
    Multiplicative,
    Displacement,
}

impl WarpMode {
    /// Channels a field of this mode carries
    pub fn channels(&self) -> usize {
        match self {
            WarpMode::Multiplicative => 1,
            WarpMode::Displacement => 3,
        }
    }
}

/// A dense field over `[batch, channels, depth, height, width]`
#[derive(Debug, Clone)]
pub struct WarpField<B: Backend> {
    pub tensor: Tensor<B, 5>,
    pub mode: WarpMode,
}

impl<B: Backend> WarpField<B> {
    pub fn new(tensor: Tensor<B, 5>, mode: WarpMode) -> Result<Self> {
        let channels = tensor.dims()[1];
        if channels != mode.channels() {
            return Err(CoTrainError::shape_mismatch(
                format!("{:?} warp field channels", mode),
                &[mode.channels()],
                &[channels],
            ));
        }
        Ok(Self { tensor, mode })
    }

    /// The field that leaves every volume unchanged
    pub fn identity(mode: WarpMode, batch: usize, spatial: [usize; 3], device: &B::Device) -> Self {
        let shape = [batch, mode.channels(), spatial[0], spatial[1], spatial[2]];
        let tensor = match mode {
            WarpMode::Multiplicative => Tensor::ones(shape, device),
            WarpMode::Displacement => Tensor::zeros(shape, device),
        };
        Self { tensor, mode }
    }

    pub fn dims(&self) -> [usize; 5] {
        self.tensor.dims()
    }

    /// Spatial extent `[depth, height, width]`
    pub fn spatial(&self) -> [usize; 3] {
        let [_, _, d, h, w] = self.dims();
        [d, h, w]
    }

    pub fn detach(self) -> Self {
        Self {
            tensor: self.tensor.detach(),
            mode: self.mode,
        }
    }
}

/// Fail unless `a` and `b` agree on batch and spatial dimensions
pub fn check_aligned(context: &str, a: [usize; 5], b: [usize; 5]) -> Result<()> {
    let key = |d: [usize; 5]| [d[0], d[2], d[3], d[4]];
    if key(a) != key(b) {
        return Err(CoTrainError::shape_mismatch(context, &a, &b));
    }
    Ok(())
}

/// Apply `field` to `source`, producing a warped image or pseudo-label.
///
/// Errors with `ShapeMismatch` when the field and source grids differ. When
/// `requires_grad` is false the result is detached from the graph.
pub fn synthesize<B: Backend>(
    field: &WarpField<B>,
    source: Tensor<B, 5>,
    requires_grad: bool,
) -> Result<Tensor<B, 5>> {
    check_aligned("warp application", field.dims(), source.dims())?;

    let warped = match field.mode {
        WarpMode::Multiplicative => field.tensor.clone() * source,
        WarpMode::Displacement => resample_trilinear(field.tensor.clone(), source),
    };

    Ok(if requires_grad { warped } else { warped.detach() })
}

/// Coordinate grid along one axis, broadcastable over `[1, 1, D, H, W]`
fn axis_grid<B: Backend>(axis: usize, spatial: [usize; 3], device: &B::Device) -> Tensor<B, 5> {
    let len = spatial[axis];
    let values: Vec<f32> = (0..len).map(|i| i as f32).collect();
    let mut shape = [1, 1, 1, 1, 1];
    shape[2 + axis] = len;
    Tensor::<B, 5>::from_floats(TensorData::new(values, shape), device)
}

fn resample_trilinear<B: Backend>(displacement: Tensor<B, 5>, source: Tensor<B, 5>) -> Tensor<B, 5> {
    let [n, c, d, h, w] = source.dims();
    let spatial = [d, h, w];
    let device = source.device();
    let voxels = d * h * w;

    // Sample positions, clamped so every corner stays inside the volume.
    let positions: Vec<Tensor<B, 5>> = (0..3)
        .map(|axis| {
            let offset = displacement.clone().narrow(1, axis, 1);
            (offset + axis_grid::<B>(axis, spatial, &device)).clamp(0.0, (spatial[axis] - 1) as f32)
        })
        .collect();

    // Non-negative after clamping, so truncation is floor.
    let lower: Vec<Tensor<B, 5>> = positions.iter().map(|p| p.clone().int().float()).collect();
    let upper: Vec<Tensor<B, 5>> = lower
        .iter()
        .zip(spatial)
        .map(|(l, size)| l.clone().add_scalar(1.0).clamp_max((size - 1) as f32))
        .collect();
    let frac: Vec<Tensor<B, 5>> = positions
        .iter()
        .zip(&lower)
        .map(|(p, l)| p.clone() - l.clone())
        .collect();

    let flat_source = source.reshape([n, c, voxels]);
    let mut out: Option<Tensor<B, 3>> = None;

    for corner in 0..8usize {
        let pick = |axis: usize| (corner >> (2 - axis)) & 1 == 1;

        let coord = |axis: usize| if pick(axis) { upper[axis].clone() } else { lower[axis].clone() };
        let weight_of = |axis: usize| {
            if pick(axis) {
                frac[axis].clone()
            } else {
                frac[axis].clone().neg().add_scalar(1.0)
            }
        };

        let linear = (coord(0) * (h * w) as f32 + coord(1) * w as f32 + coord(2)).reshape([n, 1, voxels]);
        let index: Tensor<B, 3, Int> = linear.int().repeat_dim(1, c);
        let weight = (weight_of(0) * weight_of(1) * weight_of(2)).reshape([n, 1, voxels]);

        let term = flat_source.clone().gather(2, index) * weight;
        out = Some(match out {
            Some(acc) => acc + term,
            None => term,
        });
    }

    out.unwrap_or_else(|| flat_source.zeros_like()).reshape([n, c, d, h, w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;

    fn ramp(shape: [usize; 5]) -> Tensor<TestBackend, 5> {
        let len = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..len).map(|i| (i % 7) as f32 / 7.0).collect();
        Tensor::from_floats(TensorData::new(values, shape), &Default::default())
    }

    fn values(t: Tensor<TestBackend, 5>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_identity_multiplicative_reproduces_label() {
        let device = Default::default();
        let label = ramp([1, 1, 4, 8, 8]);
        let field = WarpField::identity(WarpMode::Multiplicative, 1, [4, 8, 8], &device);

        let out = synthesize(&field, label.clone(), false).unwrap();
        assert_eq!(values(out), values(label));
    }

    #[test]
    fn test_identity_displacement_reproduces_label() {
        let device = Default::default();
        let label = ramp([2, 1, 3, 4, 5]);
        let field = WarpField::identity(WarpMode::Displacement, 2, [3, 4, 5], &device);

        let out = synthesize(&field, label.clone(), true).unwrap();
        assert_eq!(values(out), values(label));
    }

    #[test]
    fn test_constant_displacement_shifts_with_clamp() {
        let device = Default::default();
        // One row along width: [0, 1, 2, 3]
        let source = Tensor::<TestBackend, 5>::from_floats(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 1, 1, 1, 4]),
            &device,
        );
        let mut offsets = vec![0.0f32; 3 * 4];
        offsets[8..12].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let field = WarpField::new(
            Tensor::from_floats(TensorData::new(offsets, [1, 3, 1, 1, 4]), &device),
            WarpMode::Displacement,
        )
        .unwrap();

        let out = synthesize(&field, source, false).unwrap();
        assert_eq!(values(out), vec![1.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_half_voxel_displacement_interpolates() {
        let device = Default::default();
        let source = Tensor::<TestBackend, 5>::from_floats(
            TensorData::new(vec![0.0f32, 2.0], [1, 1, 1, 1, 2]),
            &device,
        );
        let mut offsets = vec![0.0f32; 3 * 2];
        offsets[4] = 0.5;
        let field = WarpField::new(
            Tensor::from_floats(TensorData::new(offsets, [1, 3, 1, 1, 2]), &device),
            WarpMode::Displacement,
        )
        .unwrap();

        let out = values(synthesize(&field, source, false).unwrap());
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let device = Default::default();
        let field = WarpField::<TestBackend>::identity(WarpMode::Multiplicative, 1, [4, 8, 8], &device);
        let err = synthesize(&field, ramp([1, 1, 4, 8, 6]), true).unwrap_err();
        assert!(matches!(err, CoTrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_wrong_channel_count_rejected() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 5>::zeros([1, 2, 2, 2, 2], &device);
        assert!(WarpField::new(tensor, WarpMode::Displacement).is_err());
    }

    #[test]
    fn test_gradient_flows_only_when_requested() {
        type AD = Autodiff<NdArray>;
        let device = Default::default();

        let field_tensor = Tensor::<AD, 5>::ones([1, 1, 2, 2, 2], &device).require_grad();
        let field = WarpField::new(field_tensor.clone(), WarpMode::Multiplicative).unwrap();
        let label = Tensor::<AD, 5>::ones([1, 1, 2, 2, 2], &device);

        let tracked = synthesize(&field, label.clone(), true).unwrap().sum();
        let grads = tracked.backward();
        assert!(field_tensor.grad(&grads).is_some());

        let frozen = synthesize(&field, label, false).unwrap();
        assert!(!frozen.is_require_grad());
    }
}
