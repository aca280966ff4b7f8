//! Burn Dataset Integration
//!
//! Samples, in-memory datasets and the batcher that stacks volumes into
//! `[batch, 1, depth, height, width]` tensors.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::dataset::volume::Volume;
use crate::utils::error::{CoTrainError, Result};

/// One co-registered sample
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeItem {
    pub id: String,
    /// Primary modality (MRI)
    pub primary: Volume,
    /// Binary ground-truth mask
    pub label: Volume,
    /// Auxiliary modality (CT)
    pub auxiliary: Volume,
}

/// Indexable source of samples.
///
/// Load failures are returned to the caller; the training loop aborts on them.
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;

    fn sample(&self, index: usize) -> Result<VolumeItem>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples held entirely in memory (synthetic data, tests)
#[derive(Debug, Clone, Default)]
pub struct InMemoryVolumes {
    items: Vec<VolumeItem>,
}

impl InMemoryVolumes {
    pub fn new(items: Vec<VolumeItem>) -> Self {
        Self { items }
    }
}

impl SampleSource for InMemoryVolumes {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn sample(&self, index: usize) -> Result<VolumeItem> {
        self.items
            .get(index)
            .cloned()
            .ok_or_else(|| CoTrainError::Dataset(format!("index {} out of range", index)))
    }
}

/// A batch of volumes, each `[batch, 1, depth, height, width]`
#[derive(Clone, Debug)]
pub struct VolumeBatch<B: Backend> {
    pub primary: Tensor<B, 5>,
    pub label: Tensor<B, 5>,
    pub auxiliary: Tensor<B, 5>,
    pub ids: Vec<String>,
}

/// Batcher for co-training batches
#[derive(Clone, Debug)]
pub struct VolumeBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> VolumeBatcher<B> {
    /// Create a new batcher for the given device
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Batch items whose volumes agree in shape per modality.
    ///
    /// Primary and auxiliary shapes may differ from each other here; that
    /// mismatch is reported by the warp stage.
    pub fn try_batch(&self, items: Vec<VolumeItem>) -> Result<VolumeBatch<B>> {
        let first = items
            .first()
            .ok_or_else(|| CoTrainError::Dataset("cannot batch zero items".to_string()))?;
        let shapes = [first.primary.shape, first.label.shape, first.auxiliary.shape];

        for item in &items[1..] {
            for (name, expected, actual) in [
                ("primary", shapes[0], item.primary.shape),
                ("label", shapes[1], item.label.shape),
                ("auxiliary", shapes[2], item.auxiliary.shape),
            ] {
                if expected != actual {
                    return Err(CoTrainError::shape_mismatch(
                        format!("batch {} volume of sample {}", name, item.id),
                        &expected,
                        &actual,
                    ));
                }
            }
        }

        Ok(self.batch(items, &self.device))
    }
}

fn stack<B: Backend>(volumes: Vec<&Volume>, device: &B::Device) -> Tensor<B, 5> {
    let [d, h, w] = volumes.first().map(|v| v.shape).unwrap_or([0, 0, 0]);
    let n = volumes.len();
    let data: Vec<f32> = volumes.iter().flat_map(|v| v.data.iter().copied()).collect();
    Tensor::<B, 5>::from_floats(TensorData::new(data, [n, 1, d, h, w]), device)
}

impl<B: Backend> Batcher<B, VolumeItem, VolumeBatch<B>> for VolumeBatcher<B> {
    fn batch(&self, items: Vec<VolumeItem>, device: &B::Device) -> VolumeBatch<B> {
        let primary = stack(items.iter().map(|i| &i.primary).collect(), device);
        let label = stack(items.iter().map(|i| &i.label).collect(), device);
        let auxiliary = stack(items.iter().map(|i| &i.auxiliary).collect(), device);
        let ids = items.into_iter().map(|i| i.id).collect();

        VolumeBatch {
            primary,
            label,
            auxiliary,
            ids,
        }
    }
}
